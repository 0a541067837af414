use crate::relay::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

const MAX_AUDIT_LOG_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    pub at_epoch_secs: u64,
    pub phase: &'a str,
    pub status: &'a str,
    pub chat_id: Option<&'a str>,
    pub message: &'a str,
}

/// Appends one JSON line describing a daemon lifecycle step.
pub fn append_event(
    audit_log: &Path,
    phase: &str,
    status: &str,
    chat_id: Option<&str>,
    message: &str,
) -> Result<()> {
    if let Some(parent) = audit_log.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        phase,
        status,
        chat_id,
        message,
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    maybe_rotate_log(audit_log);

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_log)
        .with_context(|| format!("failed to open {}", audit_log.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Best-effort variant for the daemon loop; failures only reach the log.
pub fn record(audit_log: &Path, phase: &str, status: &str, chat_id: Option<&str>, message: &str) {
    if let Err(err) = append_event(audit_log, phase, status, chat_id, message) {
        tracing::debug!("audit append failed: {err:#}");
    }
}

fn maybe_rotate_log(path: &Path) {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_AUDIT_LOG_SIZE
    {
        let backup = format!("{}.1", path.display());
        let _ = fs::rename(path, backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let log = tmp.path().join("audit.log");
        append_event(&log, "completion", "ok", Some("c1"), "delivered 2/2").expect("append");
        append_event(&log, "shutdown", "ok", None, "signal").expect("append");

        let raw = fs::read_to_string(&log).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["phase"], "completion");
        assert_eq!(first["chat_id"], "c1");
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert!(second["chat_id"].is_null());
    }
}
