use crate::relay::upstream::{ChatHistory, HistoryMessage};
use chrono::{DateTime, NaiveDateTime, Utc};

const SHOW_FILE_OPEN: &str = "<SHOW_FILE";
const SHOW_FILE_CLOSE: &str = "</SHOW_FILE>";

/// What one listener has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDigest {
    pub content: String,
    pub delivered: usize,
    pub artifacts: Vec<String>,
    /// Index to persist as the listener's cursor.
    pub last_index: i64,
}

/// `2026-02-04 14:30 UTC`; unparseable input is echoed back.
pub fn format_timestamp(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return "unknown time".to_string();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc).format("%Y-%m-%d %H:%M UTC").to_string();
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.format("%Y-%m-%d %H:%M UTC").to_string();
    }
    raw.to_string()
}

pub fn format_message(message: &HistoryMessage, chat_id: &str) -> String {
    let role = if message.from_service() {
        message.role.to_ascii_lowercase()
    } else if message.role.is_empty() {
        "openclaw".to_string()
    } else {
        message.role.clone()
    };
    format!(
        "<MESSAGE FROM {role} on Chat {chat_id} at {}>\n{}\n<MESSAGE END>\n",
        format_timestamp(message.created_at.as_deref()),
        message.content
    )
}

/// File references in `<SHOW_FILE ...>blob</SHOW_FILE>` tags. A tag with an
/// `external_local_path` attribute names that path; otherwise the blob's
/// download URL is used when known, else the blob name.
pub fn extract_artifacts(content: &str, history: &ChatHistory) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(SHOW_FILE_OPEN) {
        let after_open = &rest[start + SHOW_FILE_OPEN.len()..];
        let Some(tag_end) = after_open.find('>') else {
            break;
        };
        let attrs = &after_open[..tag_end];
        let body_and_rest = &after_open[tag_end + 1..];
        let Some(close) = body_and_rest.find(SHOW_FILE_CLOSE) else {
            break;
        };
        let blob = body_and_rest[..close].trim();

        let resolved = external_local_path(attrs)
            .map(ToOwned::to_owned)
            .or_else(|| history.blob_url(blob).map(ToOwned::to_owned))
            .unwrap_or_else(|| blob.to_string());
        if !resolved.is_empty() {
            found.push(resolved);
        }
        rest = &body_and_rest[close + SHOW_FILE_CLOSE.len()..];
    }
    found
}

fn external_local_path(attrs: &str) -> Option<&str> {
    let marker = "external_local_path=\"";
    let start = attrs.find(marker)? + marker.len();
    let len = attrs[start..].find('"')?;
    Some(&attrs[start..start + len]).filter(|p| !p.is_empty())
}

/// Formats every message after `seen` (the listener's cursor, `-1` for none).
pub fn digest_for(history: &ChatHistory, chat_id: &str, seen: i64) -> ListenerDigest {
    let start = usize::try_from(seen + 1).unwrap_or(0);
    let mut parts = Vec::new();
    let mut artifacts = Vec::new();

    for message in history.messages.iter().skip(start) {
        parts.push(format_message(message, chat_id));
        if message.from_service() {
            artifacts.extend(extract_artifacts(&message.content, history));
        }
    }

    let delivered = parts.len();
    let last_index = if delivered == 0 {
        seen
    } else {
        (history.messages.len() as i64) - 1
    };
    ListenerDigest {
        content: parts.join("\n"),
        delivered,
        artifacts,
        last_index,
    }
}
