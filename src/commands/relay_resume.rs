use anyhow::Result;

use crate::commands::CommandReport;
use crate::commands::{relay_daemon, relay_stop};
use crate::relay::paths::resolve_paths;
use crate::relay::state::StateStore;

/// Restarts tracking after a fatal stop: stops any daemon still around, then
/// spawns a fresh one if records remain.
pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("resume");
    let paths = resolve_paths()?;

    report.detail("stopping existing daemon");
    let stop_report = relay_stop::stop_daemon(&paths)?;
    let stop_ok = stop_report.ok;
    report.merge(stop_report);
    if !stop_ok {
        report.issue("resume aborted: stop failed");
        return Ok(report);
    }

    let store = StateStore::open(paths.tracked_dir.clone(), paths.chats_dir.clone())?;
    let tracked = store.load_all();
    if tracked.is_empty() {
        report.detail("nothing tracked; daemon not started");
        return Ok(report);
    }
    report.detail(format!("tracked_chats={}", tracked.len()));

    relay_daemon::ensure_running(&paths, &mut report)?;
    Ok(report)
}
