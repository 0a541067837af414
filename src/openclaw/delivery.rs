use crate::openclaw::gateway::{GatewayClient, GatewaySession};
use crate::relay::state::Listener;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Next session up the chain for `session_key`.
///
/// - `agent:<id>:main` is a root.
/// - the last `subagent:<uuid>` pair is dropped; `agent:<id>:subagent:<u>`
///   resolves to `agent:<id>:main`.
/// - any other `agent:<id>:...` key resolves to `agent:<id>:main`.
pub fn resolve_parent(session_key: &str) -> Option<String> {
    let parts: Vec<&str> = session_key.split(':').collect();

    if parts.len() == 3 && parts[2] == "main" {
        return None;
    }

    if let Some(last_idx) = parts.iter().rposition(|p| *p == "subagent")
        && last_idx >= 2
    {
        let parent = &parts[..last_idx];
        if parent.len() == 2 {
            return Some(format!("{}:{}:main", parent[0], parent[1]));
        }
        return Some(parent.join(":"));
    }

    if parts.len() >= 3 && parts[0] == "agent" {
        return Some(format!("{}:{}:main", parts[0], parts[1]));
    }

    None
}

fn redirected(original_key: &str, message: &str) -> String {
    format!("[Originally for: {original_key}]\n\n{message}")
}

/// Walks from `session_key` up its parent chain and sends to the first
/// deliverable session in `active_sessions`.
pub async fn deliver_with_fallback(
    gateway: &GatewayClient,
    session_key: &str,
    message: &str,
    active_sessions: &[GatewaySession],
) -> bool {
    let mut attempted = BTreeSet::new();
    let mut current = Some(session_key.to_string());

    while let Some(key) = current {
        if !attempted.insert(key.clone()) {
            break;
        }

        let usable = active_sessions
            .iter()
            .any(|s| s.key == key && s.can_deliver());
        if usable {
            let outgoing = if key == session_key {
                message.to_string()
            } else {
                redirected(session_key, message)
            };
            match gateway.send_to_session(&key, &outgoing).await {
                Ok(()) => {
                    if key == session_key {
                        tracing::info!(session = %key, "delivered");
                    } else {
                        tracing::info!(session = %key, original = %session_key, "delivered to parent");
                    }
                    return true;
                }
                Err(err) => tracing::warn!(session = %key, "send failed: {err:#}"),
            }
        }

        current = resolve_parent(&key);
    }

    tracing::warn!(
        target_session = %session_key,
        attempted = ?attempted,
        "no session in the parent chain accepted delivery"
    );
    false
}

/// Sends notifications to listener sessions through their gateways.
#[derive(Debug, Clone)]
pub struct DeliveryService {
    http: reqwest::Client,
}

impl DeliveryService {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create gateway http client")?;
        Ok(Self { http })
    }

    /// Same message for every listener.
    pub async fn deliver_to_all(
        &self,
        listeners: &[Listener],
        message: &str,
    ) -> BTreeMap<String, bool> {
        let batch: Vec<(&Listener, String)> = listeners
            .iter()
            .map(|l| (l, message.to_string()))
            .collect();
        self.deliver_each(&batch).await
    }

    /// One message per listener. Listeners sharing an endpoint share a
    /// single session snapshot; the first listener's auth source is used.
    pub async fn deliver_each(&self, batch: &[(&Listener, String)]) -> BTreeMap<String, bool> {
        let mut by_gateway: Vec<(&str, Vec<usize>)> = Vec::new();
        for (idx, (listener, _)) in batch.iter().enumerate() {
            match by_gateway
                .iter_mut()
                .find(|(url, _)| *url == listener.gateway_url.as_str())
            {
                Some((_, members)) => members.push(idx),
                None => by_gateway.push((listener.gateway_url.as_str(), vec![idx])),
            }
        }

        let mut results = BTreeMap::new();
        for (url, members) in by_gateway {
            let token = batch[members[0]].0.gateway_auth_source.resolve();
            let gateway = GatewayClient::new(self.http.clone(), url, token);
            let active = gateway.list_sessions().await;
            tracing::debug!(gateway = %url, sessions = active.len(), "listed active sessions");

            for idx in members {
                let (listener, message) = &batch[idx];
                let ok =
                    deliver_with_fallback(&gateway, &listener.session_key, message, &active).await;
                results.insert(listener.session_key.clone(), ok);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openclaw::auth::AuthSource;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn parent_of_main_is_none() {
        assert_eq!(resolve_parent("agent:main:main"), None);
    }

    #[test]
    fn parent_of_subagent_is_main() {
        assert_eq!(
            resolve_parent("agent:main:subagent:abc").as_deref(),
            Some("agent:main:main")
        );
    }

    #[test]
    fn parent_of_nested_subagent_drops_last_pair() {
        assert_eq!(
            resolve_parent("agent:main:subagent:a:subagent:b").as_deref(),
            Some("agent:main:subagent:a")
        );
    }

    #[test]
    fn parent_of_channel_session_is_main() {
        assert_eq!(
            resolve_parent("agent:x:telegram:dm:42").as_deref(),
            Some("agent:x:main")
        );
        assert_eq!(
            resolve_parent("agent:x:discord:group:7").as_deref(),
            Some("agent:x:main")
        );
    }

    #[test]
    fn short_or_foreign_keys_have_no_parent() {
        assert_eq!(resolve_parent("main"), None);
        assert_eq!(resolve_parent("agent:x"), None);
        assert_eq!(resolve_parent("user:x:y"), None);
    }

    fn listener(key: &str, gateway: &str) -> Listener {
        Listener::new(key, gateway, AuthSource::Literal("tok".into()), "research")
    }

    fn sessions_list_mock<'a>(server: &'a MockServer, sessions: serde_json::Value) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_list\"");
            then.status(200)
                .json_body(json!({"result": {"details": {"sessions": sessions.clone()}}}));
        })
    }

    #[tokio::test]
    async fn internal_channel_redirects_to_parent_with_annotation() {
        let server = MockServer::start();
        sessions_list_mock(
            &server,
            json!([
                {"key": "agent:main:subagent:abc", "channel": "internal"},
                {"key": "agent:main:main", "deliveryContext": {"channel": "telegram"}}
            ]),
        );
        let to_parent = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"sessionKey\":\"agent:main:main\"")
                .body_includes("[Originally for: agent:main:subagent:abc]");
            then.status(200).json_body(json!({"result": {"details": {"status": "ok"}}}));
        });
        let to_child = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"sessionKey\":\"agent:main:subagent:abc\"");
            then.status(200).json_body(json!({"result": {"details": {"status": "ok"}}}));
        });

        let service = DeliveryService::new(Duration::from_secs(5)).expect("service");
        let results = service
            .deliver_to_all(
                &[listener("agent:main:subagent:abc", &server.base_url())],
                "done",
            )
            .await;

        assert_eq!(results.get("agent:main:subagent:abc"), Some(&true));
        assert_eq!(to_parent.calls(), 1);
        assert_eq!(to_child.calls(), 0);
    }

    #[tokio::test]
    async fn direct_delivery_has_no_annotation() {
        let server = MockServer::start();
        sessions_list_mock(&server, json!([{"key": "agent:main:main", "channel": "slack"}]));
        let annotated = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("Originally for");
            then.status(200).json_body(json!({}));
        });
        let plain = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_send\"");
            then.status(200).json_body(json!({}));
        });

        let service = DeliveryService::new(Duration::from_secs(5)).expect("service");
        let results = service
            .deliver_to_all(&[listener("agent:main:main", &server.base_url())], "hello")
            .await;
        assert_eq!(results.get("agent:main:main"), Some(&true));
        assert_eq!(annotated.calls(), 0);
        assert_eq!(plain.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_failure_and_others_continue() {
        let server = MockServer::start();
        let list = sessions_list_mock(
            &server,
            json!([{"key": "agent:b:main", "channel": "telegram"}]),
        );
        server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_send\"");
            then.status(200).json_body(json!({"result": {"details": {"status": "ok"}}}));
        });

        let service = DeliveryService::new(Duration::from_secs(5)).expect("service");
        let results = service
            .deliver_to_all(
                &[
                    listener("agent:a:subagent:x", &server.base_url()),
                    listener("agent:b:main", &server.base_url()),
                ],
                "hello",
            )
            .await;
        assert_eq!(results.get("agent:a:subagent:x"), Some(&false));
        assert_eq!(results.get("agent:b:main"), Some(&true));
        assert_eq!(list.calls(), 1);
    }

    #[tokio::test]
    async fn deliver_each_sends_per_listener_text() {
        let server = MockServer::start();
        sessions_list_mock(
            &server,
            json!([
                {"key": "agent:a:main", "channel": "telegram"},
                {"key": "agent:b:main", "channel": "telegram"}
            ]),
        );
        let for_a = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"sessionKey\":\"agent:a:main\"")
                .body_includes("for a");
            then.status(200).json_body(json!({}));
        });
        let for_b = server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"sessionKey\":\"agent:b:main\"")
                .body_includes("for b");
            then.status(200).json_body(json!({}));
        });

        let a = listener("agent:a:main", &server.base_url());
        let b = listener("agent:b:main", &server.base_url());
        let service = DeliveryService::new(Duration::from_secs(5)).expect("service");
        let results = service
            .deliver_each(&[(&a, "for a".to_string()), (&b, "for b".to_string())])
            .await;
        assert!(results.values().all(|ok| *ok));
        assert_eq!(for_a.calls(), 1);
        assert_eq!(for_b.calls(), 1);
    }
}
