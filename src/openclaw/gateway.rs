use anyhow::{Context, Result};
use serde_json::{Value, json};

const LIST_LIMIT: u64 = 100;
const LIST_ACTIVE_MINUTES: u64 = 120;

/// One entry from the gateway's `sessions_list` tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySession {
    pub key: String,
    pub channel: Option<String>,
}

impl GatewaySession {
    fn from_value(value: &Value) -> Option<Self> {
        let key = value.get("key")?.as_str()?.to_string();
        let channel = value
            .get("deliveryContext")
            .and_then(|ctx| ctx.get("channel"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .or_else(|| value.get("channel").and_then(Value::as_str))
            .map(ToOwned::to_owned);
        Some(Self { key, channel })
    }

    /// Sessions on `internal`/`unknown` channels never reach a person.
    pub fn can_deliver(&self) -> bool {
        matches!(self.channel.as_deref(), Some(c) if !c.is_empty() && c != "internal" && c != "unknown")
    }
}

/// `POST <gateway>/tools/invoke` client bound to one endpoint.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}/tools/invoke", self.base_url))
            .json(&json!({ "tool": tool, "args": args }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("gateway {} unreachable for {tool}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("gateway {tool} returned {status}");
        }
        response
            .json::<Value>()
            .await
            .with_context(|| format!("gateway {tool} response was not json"))
    }

    /// Recently active sessions. Any failure yields an empty list.
    pub async fn list_sessions(&self) -> Vec<GatewaySession> {
        let args = json!({ "limit": LIST_LIMIT, "activeMinutes": LIST_ACTIVE_MINUTES });
        match self.invoke("sessions_list", args).await {
            Ok(body) => body
                .pointer("/result/details/sessions")
                .and_then(Value::as_array)
                .map(|sessions| sessions.iter().filter_map(GatewaySession::from_value).collect())
                .unwrap_or_default(),
            Err(err) => {
                tracing::error!(gateway = %self.base_url, "listing sessions failed: {err:#}");
                Vec::new()
            }
        }
    }

    pub async fn send_to_session(&self, session_key: &str, message: &str) -> Result<()> {
        let args = json!({
            "sessionKey": session_key,
            "message": message,
            "timeoutSeconds": 0,
        });
        let body = self.invoke("sessions_send", args).await?;
        if body.pointer("/result/details/status").and_then(Value::as_str) == Some("error") {
            let details = body
                .pointer("/result/details")
                .map(Value::to_string)
                .unwrap_or_default();
            anyhow::bail!("gateway rejected delivery to {session_key}: {details}");
        }
        Ok(())
    }
}
