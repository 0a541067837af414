use crate::error::{FatalError, UpstreamError};
use crate::relay::config::RelayUpstreamConfig;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatStatus {
    pub operating: bool,
    pub annotation: Option<&'static str>,
}

#[derive(Debug, Deserialize, Default)]
struct BulkStatusResponse {
    #[serde(default)]
    chats: BTreeMap<String, RawChatStatus>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawChatStatus {
    operating: bool,
    is_security_threat: bool,
    is_out_of_memory: bool,
}

impl From<RawChatStatus> for ChatStatus {
    fn from(raw: RawChatStatus) -> Self {
        let annotation = if raw.is_security_threat {
            Some("security_threat")
        } else if raw.is_out_of_memory {
            Some("out_of_memory")
        } else {
            None
        };
        Self {
            operating: raw.operating,
            annotation,
        }
    }
}

/// Role the service uses for its own messages.
pub const SERVICE_ROLE: &str = "cellcog";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryMessage {
    #[serde(default, alias = "messageFrom")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
}

impl HistoryMessage {
    pub fn from_service(&self) -> bool {
        self.role.eq_ignore_ascii_case(SERVICE_ROLE)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub blob_name_to_url: BTreeMap<String, Value>,
}

impl ChatHistory {
    /// Download URL for a blob; entries are either a bare string or `{"url": ...}`.
    pub fn blob_url(&self, blob_name: &str) -> Option<&str> {
        let entry = self.blob_name_to_url.get(blob_name)?;
        entry
            .as_str()
            .or_else(|| entry.get("url").and_then(Value::as_str))
    }
}

/// Maps an HTTP failure to its fatal class; `None` means retry later.
pub fn classify_status(status: StatusCode, body: &str) -> Option<FatalError> {
    match status.as_u16() {
        426 => {
            let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
            let field = |key: &str| {
                parsed
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string()
            };
            Some(FatalError::VersionTooOld {
                current_version: field("current_version"),
                minimum_version: field("minimum_version"),
            })
        }
        401 => Some(FatalError::AuthRejected(
            "API key invalid or revoked".to_string(),
        )),
        402 => Some(FatalError::PaymentRequired),
        403 => account_restriction(body),
        _ => None,
    }
}

/// A 403 naming an account-level block cannot be retried away; other 403s
/// stay transient.
fn account_restriction(body: &str) -> Option<FatalError> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let error_type = parsed.get("error_type")?.as_str()?;
    if !matches!(
        error_type,
        "email_not_verified" | "account_security_flagged" | "account_disabled"
    ) {
        return None;
    }
    let detail = parsed
        .get("detail")
        .and_then(Value::as_str)
        .unwrap_or("account disabled");
    Some(FatalError::Other(format!(
        "account restricted ({error_type}): {detail}"
    )))
}

/// HTTP client for the orchestration service.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    history_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &RelayUpstreamConfig, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-API-Key",
            HeaderValue::from_str(api_key.trim()).context("api key is not a valid header value")?,
        );
        headers.insert("X-Client-Version", HeaderValue::from_static(CLIENT_VERSION));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to create upstream http client")?;

        Ok(Self {
            http,
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            history_timeout: Duration::from_secs(config.history_timeout_secs.max(1)),
        })
    }

    /// Status of every requested chat in one call. Ids absent from the map
    /// are unknown upstream.
    pub async fn bulk_status(
        &self,
        chat_ids: &[String],
    ) -> Result<BTreeMap<String, ChatStatus>, UpstreamError> {
        let response = self
            .http
            .post(format!("{}/chats/status", self.api_base))
            .json(&json!({ "chat_ids": chat_ids }))
            .send()
            .await
            .map_err(UpstreamError::transient)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &body) {
                Some(fatal) => fatal.into(),
                None => UpstreamError::Transient(format!("chats/status returned {status}")),
            });
        }

        let parsed: BulkStatusResponse = response.json().await.map_err(UpstreamError::transient)?;
        Ok(parsed
            .chats
            .into_iter()
            .map(|(id, raw)| (id, ChatStatus::from(raw)))
            .collect())
    }

    pub async fn history(&self, chat_id: &str) -> Result<ChatHistory> {
        let response = self
            .http
            .get(format!("{}/chat/{chat_id}/history", self.api_base))
            .timeout(self.history_timeout)
            .send()
            .await
            .with_context(|| format!("history request for {chat_id} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("history for {chat_id} returned {status}");
        }
        response
            .json::<ChatHistory>()
            .await
            .with_context(|| format!("history for {chat_id} was not valid json"))
    }

    /// Push channel address: the API base with its scheme mapped to ws/wss.
    pub fn push_url(&self) -> Result<reqwest::Url> {
        let ws_base = if let Some(rest) = self.api_base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.api_base.clone()
        };
        let mut url = reqwest::Url::parse(&format!("{ws_base}/ws/user/stream"))
            .with_context(|| format!("invalid push url derived from {}", self.api_base))?;
        url.query_pairs_mut().append_pair("api_key", &self.api_key);
        Ok(url)
    }

    pub fn masked_push_url(&self) -> String {
        let visible: String = self.api_key.chars().take(6).collect();
        format!("{}/ws/user/stream?api_key={visible}...", self.api_base)
    }
}
