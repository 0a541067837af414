use anyhow::Result;

use crate::commands::CommandReport;
use crate::commands::relay_daemon;
use crate::openclaw::auth::AuthSource;
use crate::relay::paths::resolve_paths;
use crate::relay::state::{Listener, StateStore, TrackedChat, valid_chat_id};

#[derive(Debug, Clone)]
pub struct TrackOptions {
    pub chat_id: String,
    pub session_key: String,
    pub gateway_url: String,
    pub auth_source: String,
    pub label: String,
    pub no_spawn: bool,
}

/// Adds a listener to the chat's record, creating the record on first use,
/// then makes sure a current daemon is watching it.
pub fn run(opts: &TrackOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("track");

    if !valid_chat_id(&opts.chat_id) {
        report.issue(format!("invalid chat id: {:?}", opts.chat_id));
        return Ok(report);
    }
    if opts.session_key.trim().is_empty() {
        report.issue("session key cannot be empty");
        return Ok(report);
    }
    let auth_source = match opts.auth_source.parse::<AuthSource>() {
        Ok(source) => source,
        Err(err) => {
            report.issue(format!("invalid auth source: {err}"));
            return Ok(report);
        }
    };

    let paths = resolve_paths()?;
    let store = StateStore::open(paths.tracked_dir.clone(), paths.chats_dir.clone())?;
    let listener = Listener::new(
        opts.session_key.trim(),
        opts.gateway_url.trim(),
        auth_source,
        opts.label.trim(),
    );

    let path = store.path_for(&opts.chat_id);
    let chat = if path.exists() {
        match store.load(&path) {
            Ok(mut chat) => {
                if chat.add_listener(listener) {
                    report.detail(format!("listener added ({} total)", chat.listeners.len()));
                } else {
                    report.detail("listener already registered");
                }
                chat
            }
            Err(err) => {
                report.detail(format!("replacing unreadable record: {err:#}"));
                TrackedChat::new(opts.chat_id.clone(), listener)
            }
        }
    } else {
        report.detail("tracking new chat");
        TrackedChat::new(opts.chat_id.clone(), listener)
    };

    let saved = store.save(&chat)?;
    report.detail(format!("chat_id={}", chat.chat_id));
    report.detail(format!("record={}", saved.display()));

    if opts.no_spawn {
        report.detail("daemon spawn skipped (--no-spawn)");
        return Ok(report);
    }
    relay_daemon::ensure_running(&paths, &mut report)?;
    Ok(report)
}
