use crate::error::FatalError;
use crate::relay::config::RelayPushConfig;
use crate::relay::monitor::MonitorEvent;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::connect_async;

/// A push frame the monitor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Completed { chat_id: String },
    AgentUpdate { chat_id: String, text: String },
}

pub fn parse_frame(raw: &str) -> Option<PushFrame> {
    if raw.trim() == "pong" {
        return None;
    }
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("push frame is not json: {}", crate::relay::util::truncate_with_ellipsis(raw, 100));
            return None;
        }
    };
    let data = value.get("data")?;
    let chat_id = data.get("chat_id")?.as_str()?.to_string();
    match value.get("type")?.as_str()? {
        "CHAT_COMPLETED" => Some(PushFrame::Completed { chat_id }),
        "CHAT_STREAM_CHUNK" if data.get("message_type").and_then(Value::as_str) == Some("AGENT_UPDATE") => {
            let text = data.get("text").and_then(Value::as_str)?.trim().to_string();
            (!text.is_empty()).then_some(PushFrame::AgentUpdate { chat_id, text })
        }
        _ => None,
    }
}

enum SessionEnd {
    /// Nothing tracked any more; wait quietly for new chats.
    Idle,
    Dropped(String),
    /// The monitor is gone.
    Shutdown,
}

/// Keeps one push connection open while at least one chat is tracked.
pub async fn run_push_loop(
    url: reqwest::Url,
    config: RelayPushConfig,
    mut tracked: watch::Receiver<BTreeSet<String>>,
    events: mpsc::Sender<MonitorEvent>,
) {
    let reconnect = Duration::from_secs(config.reconnect_secs.max(1));
    let connect_timeout = Duration::from_secs(config.ping_timeout_secs.max(1));
    loop {
        if tracked.wait_for(|ids| !ids.is_empty()).await.is_err() {
            return;
        }

        tracing::info!("connecting push channel");
        let attempt = tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await;
        let Ok(connected) = attempt else {
            tracing::warn!(
                "push handshake timed out after {}s, relying on polling",
                connect_timeout.as_secs()
            );
            tokio::time::sleep(reconnect).await;
            continue;
        };
        let stream = match connected {
            Ok((stream, _response)) => stream,
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                let status = response.status().as_u16();
                tracing::error!(status, "push channel rejected credentials");
                let fatal = FatalError::AuthRejected(format!("push channel rejected (HTTP {status})"));
                let _ = events.send(MonitorEvent::Fatal(fatal)).await;
                return;
            }
            Err(err) => {
                tracing::warn!("push connect failed, relying on polling: {err}");
                tokio::time::sleep(reconnect).await;
                continue;
            }
        };
        tracing::info!("push channel connected");

        match run_session(stream, &config, &mut tracked, &events).await {
            SessionEnd::Idle => tracing::info!("push channel closed, nothing tracked"),
            SessionEnd::Shutdown => return,
            SessionEnd::Dropped(reason) => {
                tracing::warn!("push channel dropped ({reason}), relying on polling");
                tokio::time::sleep(reconnect).await;
            }
        }
    }
}

async fn run_session<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    config: &RelayPushConfig,
    tracked: &mut watch::Receiver<BTreeSet<String>>,
    events: &mpsc::Sender<MonitorEvent>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let ping_every = Duration::from_secs(config.ping_interval_secs.max(1));
    let liveness = ping_every + Duration::from_secs(config.ping_timeout_secs);
    let mut ping_tick = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            maybe_message = source.next() => {
                let message = match maybe_message {
                    None => return SessionEnd::Dropped("stream ended".into()),
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                    Some(Ok(message)) => message,
                };
                last_frame = Instant::now();
                let text = match message {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => return SessionEnd::Dropped("closed by server".into()),
                    WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                };
                let Some(frame) = parse_frame(&text) else {
                    continue;
                };
                let event = match frame {
                    PushFrame::Completed { chat_id } if tracked.borrow().contains(&chat_id) => {
                        tracing::info!(chat = %chat_id, "completion pushed");
                        MonitorEvent::Completed(chat_id)
                    }
                    PushFrame::AgentUpdate { chat_id, text } if tracked.borrow().contains(&chat_id) => {
                        MonitorEvent::Progress { chat_id, text }
                    }
                    _ => continue,
                };
                if events.send(event).await.is_err() {
                    return SessionEnd::Shutdown;
                }
            }
            _ = ping_tick.tick() => {
                if last_frame.elapsed() > liveness {
                    return SessionEnd::Dropped("no frames within ping timeout".into());
                }
                if let Err(err) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    return SessionEnd::Dropped(err.to_string());
                }
            }
            changed = tracked.changed() => {
                if changed.is_err() {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                if tracked.borrow().is_empty() {
                    let _ = sink.close().await;
                    return SessionEnd::Idle;
                }
            }
        }
    }
}
