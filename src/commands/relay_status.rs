use anyhow::Result;

use crate::commands::CommandReport;
use crate::openclaw::paths::resolve_paths as resolve_openclaw_paths;
use crate::relay::config::{API_KEY_ENV, SECRET_ENV_KEYS, api_key, load_config, masked_env_secret};
use crate::relay::daemon_lock::{
    current_version_marker, lock_is_held, read_daemon_lock_payload, read_version_marker,
};
use crate::relay::paths::resolve_paths;
use crate::relay::state::StateStore;
use crate::relay::util::pid_alive;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("relay_home={}", paths.relay_home.display()));
    report.detail(format!("tracked_dir={}", paths.tracked_dir.display()));
    report.detail(format!("log_file={}", paths.log_file.display()));
    if let Ok(openclaw) = resolve_openclaw_paths() {
        report.detail(format!("openclaw_state_dir={}", openclaw.state_dir.display()));
        report.detail(format!("openclaw_config={}", openclaw.config_path.display()));
    }

    match load_config(&paths.relay_home) {
        Ok(cfg) => {
            report.detail(format!("upstream.api_base_url={}", cfg.upstream.api_base_url));
            report.detail(format!("monitor.poll_interval_secs={}", cfg.monitor.poll_interval_secs));
            report.detail(format!("push.enabled={}", cfg.push.enabled));
            report.detail(format!("interim.flush_secs={}", cfg.interim.flush_secs));
            report.detail(format!(
                "interim.max_updates_per_chat={}",
                cfg.interim.max_updates_per_chat
            ));
        }
        Err(err) => report.issue(format!("invalid relay config: {err:#}")),
    }

    for key in SECRET_ENV_KEYS {
        report.detail(format!("{key}={}", masked_env_secret(key)));
    }
    if api_key().is_none() {
        report.issue(format!("{API_KEY_ENV} is not set"));
    }

    let running = lock_is_held(&paths);
    report.detail(format!("daemon_running={running}"));
    if let Ok(Some(payload)) = read_daemon_lock_payload(&paths) {
        report.detail(format!(
            "daemon_pid={} alive={}",
            payload.pid,
            pid_alive(payload.pid)
        ));
    }
    if running {
        let marker = read_version_marker(&paths).unwrap_or_else(|| "<unknown>".to_string());
        if marker != current_version_marker() {
            report.detail(format!(
                "daemon_version={marker} (stale; next `track` replaces it)"
            ));
        } else {
            report.detail(format!("daemon_version={marker}"));
        }
    }

    let store = StateStore::open(paths.tracked_dir.clone(), paths.chats_dir.clone())?;
    let tracked = store.load_all();
    report.detail(format!("tracked_chats={}", tracked.len()));
    for chat in tracked.values() {
        report.detail(format!(
            "chat={} listeners={} label={}",
            chat.chat_id,
            chat.listeners.len(),
            chat.primary_label()
        ));
    }

    Ok(report)
}
