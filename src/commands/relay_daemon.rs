use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::CommandReport;
use crate::commands::relay_stop;
use crate::openclaw::delivery::DeliveryService;
use crate::relay::audit;
use crate::relay::config::{API_KEY_ENV, api_key, load_config};
use crate::relay::daemon_lock::{
    DaemonLock, current_version_marker, lock_is_held, read_version_marker,
};
use crate::relay::monitor::{ChatMonitor, MonitorExit};
use crate::relay::paths::{RelayPaths, resolve_paths};
use crate::relay::state::StateStore;
use crate::relay::upstream::UpstreamClient;

const SPAWN_WAIT: Duration = Duration::from_secs(3);
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!("SIGTERM handler unavailable: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Runs the monitor in the foreground until it has nothing left to do.
pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("daemon");
    let paths = resolve_paths()?;
    let config = load_config(&paths.relay_home)?;

    let Some(key) = api_key() else {
        report.issue(format!("{API_KEY_ENV} is not set; the daemon cannot reach the service"));
        return Ok(report);
    };

    let lock = match DaemonLock::acquire(&paths) {
        Ok(lock) => lock,
        Err(err) => {
            report.issue(format!("{err:#}"));
            return Ok(report);
        }
    };
    report.detail(format!("daemon_pid={}", std::process::id()));
    report.detail(format!("version={}", current_version_marker()));
    tracing::info!(
        pid = std::process::id(),
        home = %paths.relay_home.display(),
        "chat-relay daemon starting"
    );
    audit::record(&paths.audit_log, "startup", "ok", None, &current_version_marker());

    let store = StateStore::open(paths.tracked_dir.clone(), paths.chats_dir.clone())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let exit = runtime.block_on(async {
        let upstream = UpstreamClient::new(&config.upstream, &key)?;
        let delivery =
            DeliveryService::new(Duration::from_secs(config.upstream.request_timeout_secs))?;
        let monitor =
            ChatMonitor::new(store, upstream, delivery, config, paths.audit_log.clone());
        anyhow::Ok(monitor.run(shutdown_signal()).await)
    })?;
    drop(lock);

    match exit {
        MonitorExit::NothingTracked => report.detail("exited: nothing left to track"),
        MonitorExit::Shutdown => report.detail("exited: shutdown requested"),
        MonitorExit::Fatal(kind) => {
            report.issue(format!(
                "exited on fatal upstream error ({kind}); fix it and run `chat-relay resume`"
            ));
        }
    }
    tracing::info!(?exit, "chat-relay daemon stopped");
    Ok(report)
}

/// Starts `chat-relay daemon` in its own process group with stderr appended
/// to the daemon log.
pub fn spawn_detached(paths: &RelayPaths) -> Result<u32> {
    fs::create_dir_all(&paths.relay_home)
        .with_context(|| format!("failed to create {}", paths.relay_home.display()))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)
        .with_context(|| format!("failed to open {}", paths.log_file.display()))?;
    let exe = std::env::current_exe().context("failed to resolve current executable")?;

    let child = Command::new(exe)
        .arg("daemon")
        .env("CHAT_RELAY_HOME", &paths.relay_home)
        .env("CHAT_RELAY_TRACKED_DIR", &paths.tracked_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .process_group(0)
        .spawn()
        .context("failed to spawn chat-relay daemon")?;
    Ok(child.id())
}

fn wait_for_lock(paths: &RelayPaths) -> bool {
    let deadline = Instant::now() + SPAWN_WAIT;
    while Instant::now() < deadline {
        if lock_is_held(paths) {
            return true;
        }
        thread::sleep(SPAWN_POLL_INTERVAL);
    }
    false
}

/// Leaves a daemon of the current build running: keeps a matching one,
/// replaces a stale one, spawns one when none holds the lock.
pub fn ensure_running(paths: &RelayPaths, report: &mut CommandReport) -> Result<()> {
    let current = current_version_marker();
    if lock_is_held(paths) {
        let running = read_version_marker(paths);
        if running.as_deref() == Some(current.as_str()) {
            report.detail("daemon already running");
            return Ok(());
        }
        report.detail(format!(
            "daemon version {} differs from {current}; replacing",
            running.as_deref().unwrap_or("<unknown>")
        ));
        let stop = relay_stop::stop_daemon(paths)?;
        let stopped = stop.ok;
        report.merge(stop);
        if !stopped {
            report.issue("daemon replacement aborted: stop failed");
            return Ok(());
        }
    }

    let pid = spawn_detached(paths)?;
    if wait_for_lock(paths) {
        report.detail(format!("daemon started pid={pid}"));
    } else {
        report.detail(format!(
            "daemon spawned pid={pid} but lock not observed yet; see {}",
            paths.log_file.display()
        ));
    }
    Ok(())
}
