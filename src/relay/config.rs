use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_ENV: &str = "CHAT_RELAY_API_KEY";
pub const SECRET_ENV_KEYS: [&str; 1] = [API_KEY_ENV];
pub const DEFAULT_API_BASE_URL: &str = "https://cellcog.ai/api/cellcog";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayUpstreamConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub history_timeout_secs: u64,
}

impl Default for RelayUpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 30,
            history_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayMonitorConfig {
    pub poll_interval_secs: u64,
    pub watch_interval_ms: u64,
}

impl Default for RelayMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            watch_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPushConfig {
    pub enabled: bool,
    pub reconnect_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for RelayPushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_secs: 30,
            ping_interval_secs: 30,
            ping_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInterimConfig {
    pub flush_secs: u64,
    pub check_secs: u64,
    pub max_updates_per_chat: usize,
}

impl Default for RelayInterimConfig {
    fn default() -> Self {
        Self {
            flush_secs: 240,
            check_secs: 60,
            max_updates_per_chat: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub upstream: RelayUpstreamConfig,
    pub monitor: RelayMonitorConfig,
    pub push: RelayPushConfig,
    pub interim: RelayInterimConfig,
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.watch_interval_ms)
    }

    pub fn interim_flush(&self) -> Duration {
        Duration::from_secs(self.interim.flush_secs)
    }

    pub fn interim_check(&self) -> Duration {
        Duration::from_secs(self.interim.check_secs)
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

pub fn validate(cfg: &RelayConfig) -> Result<()> {
    if cfg.upstream.api_base_url.trim().is_empty() {
        return Err(anyhow!("invalid upstream api_base_url: cannot be empty"));
    }
    if cfg.upstream.request_timeout_secs == 0 || cfg.upstream.history_timeout_secs == 0 {
        return Err(anyhow!("invalid upstream timeouts: must be >= 1 second"));
    }
    if cfg.monitor.poll_interval_secs == 0 {
        return Err(anyhow!("invalid poll interval: must be >= 1 second"));
    }
    if cfg.monitor.watch_interval_ms == 0 {
        return Err(anyhow!("invalid watch interval: must be >= 1 ms"));
    }
    if cfg.push.reconnect_secs == 0 || cfg.push.ping_interval_secs == 0 {
        return Err(anyhow!("invalid push timings: must be >= 1 second"));
    }
    if cfg.interim.flush_secs == 0 || cfg.interim.check_secs == 0 {
        return Err(anyhow!("invalid interim timings: must be >= 1 second"));
    }
    if cfg.interim.max_updates_per_chat == 0 {
        return Err(anyhow!("invalid interim max_updates_per_chat: must be >= 1"));
    }
    Ok(())
}

fn resolve_config_path(relay_home: &Path) -> PathBuf {
    if let Ok(custom) = env::var("CHAT_RELAY_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    relay_home.join("relay.toml")
}

fn merge_file_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    toml::from_str::<RelayConfig>(&raw)
        .map_err(|err| anyhow!("failed to parse relay config {}: {err}", path.display()))
}

fn apply_env_overrides(cfg: &mut RelayConfig) {
    cfg.upstream.api_base_url = env_or_string("CHAT_RELAY_API_URL", &cfg.upstream.api_base_url);
    cfg.upstream.request_timeout_secs = env_or_u64(
        "CHAT_RELAY_REQUEST_TIMEOUT_SECS",
        cfg.upstream.request_timeout_secs,
    );
    cfg.monitor.poll_interval_secs =
        env_or_u64("CHAT_RELAY_POLL_INTERVAL_SECS", cfg.monitor.poll_interval_secs);
    cfg.monitor.watch_interval_ms =
        env_or_u64("CHAT_RELAY_WATCH_INTERVAL_MS", cfg.monitor.watch_interval_ms);
    cfg.push.enabled = env_or_bool("CHAT_RELAY_PUSH_ENABLED", cfg.push.enabled);
    cfg.push.reconnect_secs = env_or_u64("CHAT_RELAY_PUSH_RECONNECT_SECS", cfg.push.reconnect_secs);
    cfg.interim.flush_secs = env_or_u64("CHAT_RELAY_INTERIM_FLUSH_SECS", cfg.interim.flush_secs);
    cfg.interim.check_secs = env_or_u64("CHAT_RELAY_INTERIM_CHECK_SECS", cfg.interim.check_secs);
    cfg.interim.max_updates_per_chat = env_or_u64(
        "CHAT_RELAY_MAX_UPDATES",
        cfg.interim.max_updates_per_chat as u64,
    ) as usize;
}

pub fn load_config(relay_home: &Path) -> Result<RelayConfig> {
    let mut cfg = merge_file_config(&resolve_config_path(relay_home))?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

pub fn api_key() -> Option<String> {
    match env::var(API_KEY_ENV) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

pub fn masked_env_secret(key: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => {
            let visible: String = v.trim().chars().take(6).collect();
            format!("{visible}...(set)")
        }
        _ => "(unset)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.monitor.poll_interval_secs, 30);
        assert_eq!(cfg.interim.flush_secs, 240);
        assert_eq!(cfg.interim.max_updates_per_chat, 50);
        assert!(cfg.push.enabled);
        validate(&cfg).expect("defaults validate");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("relay.toml");
        fs::write(
            &path,
            "[interim]\nflush_secs = 120\n\n[monitor]\npoll_interval_secs = 5\n",
        )
        .expect("write config");

        let cfg = merge_file_config(&path).expect("parse config");
        assert_eq!(cfg.interim.flush_secs, 120);
        assert_eq!(cfg.interim.max_updates_per_chat, 50);
        assert_eq!(cfg.monitor.poll_interval_secs, 5);
        assert_eq!(cfg.monitor.watch_interval_ms, 1_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempdir().expect("tempdir");
        let cfg = merge_file_config(&tmp.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg.upstream.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn validate_rejects_zero_cap() {
        let mut cfg = RelayConfig::default();
        cfg.interim.max_updates_per_chat = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut cfg = RelayConfig::default();
        cfg.monitor.poll_interval_secs = 0;
        assert!(validate(&cfg).is_err());
    }
}
