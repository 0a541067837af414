use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RelayPaths {
    pub relay_home: PathBuf,
    pub tracked_dir: PathBuf,
    pub chats_dir: PathBuf,
    pub pid_file: PathBuf,
    pub version_file: PathBuf,
    pub log_file: PathBuf,
    pub audit_log: PathBuf,
    pub relay_home_is_explicit: bool,
}

impl RelayPaths {
    /// Lays out every relay file under one root directory.
    pub fn under(relay_home: PathBuf) -> Self {
        Self {
            tracked_dir: relay_home.join("tracked_chats"),
            chats_dir: relay_home.join("chats"),
            pid_file: relay_home.join("daemon.pid"),
            version_file: relay_home.join("daemon.version"),
            log_file: relay_home.join("daemon.log"),
            audit_log: relay_home.join("audit.log"),
            relay_home,
            relay_home_is_explicit: true,
        }
    }
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn relay_home_from_inputs(home: PathBuf, relay_home_env: Option<&str>) -> (PathBuf, bool) {
    match relay_home_env {
        Some(v) if !v.trim().is_empty() => (PathBuf::from(v.trim()), true),
        _ => (home.join(".chat-relay"), false),
    }
}

pub fn resolve_paths() -> Result<RelayPaths> {
    let home = required_home_dir()?;
    let relay_home_env = env::var("CHAT_RELAY_HOME").ok();
    let (relay_home, is_explicit) = relay_home_from_inputs(home, relay_home_env.as_deref());

    let mut paths = RelayPaths::under(relay_home);
    paths.tracked_dir = env_or_default_path("CHAT_RELAY_TRACKED_DIR", paths.tracked_dir);
    paths.relay_home_is_explicit = is_explicit;
    Ok(paths)
}
