use anyhow::{Context, Result};
use std::fs;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::CommandReport;
use crate::relay::daemon_lock::{lock_is_held, read_daemon_lock_payload};
use crate::relay::paths::{RelayPaths, resolve_paths};
use crate::relay::util::{pid_alive, run_command_with_optional_timeout};

const STOP_TIMEOUT: Duration = Duration::from_secs(8);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const COMMAND_TIMEOUT_SECS: u64 = 10;

fn process_command_line(pid: u32) -> Result<String> {
    let mut ps_cmd = Command::new("ps");
    ps_cmd
        .arg("-p")
        .arg(pid.to_string())
        .arg("-o")
        .arg("command=");
    let output = run_command_with_optional_timeout(&mut ps_cmd, Some(COMMAND_TIMEOUT_SECS))
        .context("failed to inspect process command line with `ps`")?;
    if !output.status.success() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn send_sigterm(pid: u32) -> Result<()> {
    let mut kill_cmd = Command::new("kill");
    kill_cmd.arg("-TERM").arg(pid.to_string());
    let out = run_command_with_optional_timeout(&mut kill_cmd, Some(COMMAND_TIMEOUT_SECS))
        .context("failed to send SIGTERM with `kill -TERM`")?;
    if out.status.success() || !pid_alive(pid) {
        return Ok(());
    }
    anyhow::bail!("`kill -TERM {pid}` failed and process is still alive");
}

fn cleanup_pid_file(paths: &RelayPaths, report: &mut CommandReport) {
    if lock_is_held(paths) {
        return;
    }
    match fs::remove_file(&paths.pid_file) {
        Ok(()) => report.detail(format!("removed stale pid file {}", paths.pid_file.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => report.detail(format!(
            "failed to remove pid file {}: {err}",
            paths.pid_file.display()
        )),
    }
}

/// SIGTERM the recorded daemon and wait for it to exit. Tracking files are
/// left in place.
pub fn stop_daemon(paths: &RelayPaths) -> Result<CommandReport> {
    let mut report = CommandReport::new("stop");
    report.detail(format!("pid_file={}", paths.pid_file.display()));

    let payload = match read_daemon_lock_payload(paths) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            report.detail("daemon already stopped (no pid recorded)");
            return Ok(report);
        }
        Err(err) => {
            report.issue(format!("{err:#}"));
            return Ok(report);
        }
    };
    let pid = payload.pid;
    report.detail(format!("daemon_pid={pid}"));

    if !pid_alive(pid) {
        report.detail(format!("daemon pid {pid} is not running"));
        cleanup_pid_file(paths, &mut report);
        return Ok(report);
    }

    let command_line = process_command_line(pid)?;
    if !command_line.contains("daemon") {
        report.issue(format!(
            "refusing to stop pid {pid}; command does not look like a chat-relay daemon: {}",
            if command_line.is_empty() {
                "<unknown>"
            } else {
                command_line.as_str()
            }
        ));
        return Ok(report);
    }

    send_sigterm(pid)?;
    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            report.detail(format!("stopped chat-relay daemon pid={pid}"));
            cleanup_pid_file(paths, &mut report);
            return Ok(report);
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    report.issue(format!(
        "timed out waiting for daemon pid {pid} to stop after {}s",
        STOP_TIMEOUT.as_secs()
    ));
    Ok(report)
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    stop_daemon(&paths)
}
