//! Text delivered to listener sessions.

use crate::error::FatalError;
use crate::relay::history::ListenerDigest;
use crate::relay::state::TrackedChat;
use crate::relay::updates::AgentUpdate;
use crate::relay::util::truncate_with_ellipsis;
use std::collections::BTreeMap;
use std::time::Instant;

const INTERIM_SHOWN: usize = 10;
const INTERIM_TEXT_CHARS: usize = 100;

pub fn completion_message(chat_id: &str, task_label: &str, digest: &ListenerDigest) -> String {
    let mut stats = format!(
        "Chat ID: {chat_id}\nMessages delivered: {}",
        digest.delivered
    );
    if !digest.artifacts.is_empty() {
        stats.push_str("\nFiles produced:");
        for artifact in &digest.artifacts {
            stats.push_str(&format!("\n  - {artifact}"));
        }
    }

    let action = format!(
        "⚠️ YOUR TURN: the remote agent has finished and is waiting for you.\n\
         To continue, send a follow-up to chat {chat_id} and track it again:\n  \
         chat-relay track --chat-id {chat_id} --session-key <your session> --label \"continue\" ...\n\
         If this task is complete, no action needed."
    );

    format!(
        "✅ {task_label} completed!\n\n{stats}\n\n{action}\n\n{}",
        digest.content
    )
}

fn relative_time(elapsed_secs: u64) -> String {
    match elapsed_secs {
        0..60 => "just now".to_string(),
        60..3600 => format!("{}m ago", elapsed_secs / 60),
        _ => format!("{}h ago", elapsed_secs / 3600),
    }
}

/// Progress digest: newest first, at most ten entries.
pub fn interim_message(
    chat_id: &str,
    task_label: &str,
    updates: &[AgentUpdate],
    now: Instant,
) -> String {
    let mut lines = vec![
        format!("⏳ {task_label} - still working"),
        String::new(),
        "Your request is still being processed. The final response is not ready yet.".to_string(),
        String::new(),
        "Recent activity (newest first):".to_string(),
    ];

    for update in updates.iter().rev().take(INTERIM_SHOWN) {
        let elapsed = now.saturating_duration_since(update.at).as_secs();
        lines.push(format!(
            "  • [{}] {}",
            relative_time(elapsed),
            truncate_with_ellipsis(&update.text, INTERIM_TEXT_CHARS)
        ));
    }
    if updates.len() > INTERIM_SHOWN {
        lines.push(format!(
            "  ... and {} earlier updates",
            updates.len() - INTERIM_SHOWN
        ));
    }

    lines.extend([
        String::new(),
        format!("Chat ID: {chat_id}"),
        String::new(),
        "The complete response will be delivered when the chat finishes.".to_string(),
    ]);
    lines.join("\n")
}

fn affected_tasks(tracked: &BTreeMap<String, TrackedChat>) -> String {
    let lines: Vec<String> = tracked
        .values()
        .flat_map(|chat| {
            chat.listeners
                .iter()
                .map(move |l| format!("  • {} ({})", l.task_label, chat.chat_id))
        })
        .collect();
    if lines.is_empty() {
        "  (none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Remediation broadcast for a fatal upstream condition.
pub fn fatal_message(error: &FatalError, tracked: &BTreeMap<String, TrackedChat>) -> String {
    let tasks = affected_tasks(tracked);
    match error {
        FatalError::VersionTooOld {
            current_version,
            minimum_version,
        } => format!(
            "❌ chat-relay error: upgrade required\n\n\
             This client ({current_version}) is too old. Minimum required: {minimum_version}\n\n\
             To fix:\n\
             1. Install a chat-relay release >= {minimum_version}\n\
             2. chat-relay resume\n\n\
             Affected tasks:\n{tasks}\n\n\
             Tracking state preserved. After upgrading, `chat-relay resume` recovers all tasks."
        ),
        FatalError::AuthRejected(reason) => format!(
            "❌ chat-relay error: authentication failed\n\n\
             The API key was rejected ({reason}).\n\n\
             To fix:\n\
             1. Create a new API key with the service\n\
             2. export CHAT_RELAY_API_KEY=\"<new key>\"\n\
             3. chat-relay resume\n\n\
             Affected tasks:\n{tasks}\n\n\
             Tracking state preserved."
        ),
        FatalError::PaymentRequired => format!(
            "❌ chat-relay error: payment required\n\n\
             The account needs credits to continue.\n\n\
             To fix:\n\
             1. Add credits to the account\n\
             2. chat-relay resume\n\n\
             Affected tasks:\n{tasks}\n\n\
             Tracking state preserved."
        ),
        FatalError::Other(detail) => format!(
            "❌ chat-relay error\n\n\
             Unexpected error: {detail}\n\n\
             Try: chat-relay resume\n\n\
             Affected tasks:\n{tasks}"
        ),
    }
}
