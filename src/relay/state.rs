use crate::openclaw::auth::AuthSource;
use crate::relay::util::now_rfc3339;
use crate::relay::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Missing, null or blank timestamps read as "now".
fn timestamp_or_now<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|raw| !raw.trim().is_empty())
        .unwrap_or_else(now_rfc3339))
}

/// One session waiting on a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub session_key: String,
    pub gateway_url: String,
    pub gateway_auth_source: AuthSource,
    pub task_label: String,
    #[serde(default = "now_rfc3339", deserialize_with = "timestamp_or_now")]
    pub added_at: String,
}

impl Listener {
    pub fn new(
        session_key: impl Into<String>,
        gateway_url: impl Into<String>,
        gateway_auth_source: AuthSource,
        task_label: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            gateway_url: gateway_url.into(),
            gateway_auth_source,
            task_label: task_label.into(),
            added_at: now_rfc3339(),
        }
    }
}

// Identity is the session address alone.
impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.session_key == other.session_key
    }
}

impl Eq for Listener {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedChat {
    pub chat_id: String,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default = "now_rfc3339", deserialize_with = "timestamp_or_now")]
    pub created_at: String,
    #[serde(default = "now_rfc3339", deserialize_with = "timestamp_or_now")]
    pub last_verified_at: String,
}

impl TrackedChat {
    pub fn new(chat_id: impl Into<String>, first: Listener) -> Self {
        let now = now_rfc3339();
        Self {
            chat_id: chat_id.into(),
            listeners: vec![first],
            created_at: now.clone(),
            last_verified_at: now,
        }
    }

    /// Returns false when a listener with the same session key is already present.
    pub fn add_listener(&mut self, listener: Listener) -> bool {
        if self.listeners.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    pub fn touch_verified(&mut self) {
        self.last_verified_at = now_rfc3339();
    }

    pub fn primary_label(&self) -> &str {
        self.listeners
            .first()
            .map(|l| l.task_label.as_str())
            .unwrap_or(self.chat_id.as_str())
    }
}

pub fn valid_chat_id(chat_id: &str) -> bool {
    !chat_id.is_empty()
        && chat_id != "."
        && chat_id != ".."
        && !chat_id.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone)]
pub struct StateStore {
    tracked_dir: PathBuf,
    chats_dir: PathBuf,
}

impl StateStore {
    pub fn open(tracked_dir: impl Into<PathBuf>, chats_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            tracked_dir: tracked_dir.into(),
            chats_dir: chats_dir.into(),
        };
        for dir in [&store.tracked_dir, &store.chats_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn tracked_dir(&self) -> &Path {
        &self.tracked_dir
    }

    pub fn path_for(&self, chat_id: &str) -> PathBuf {
        self.tracked_dir.join(format!("{chat_id}.json"))
    }

    /// Chat id a tracking file name refers to, if it looks like one.
    pub fn chat_id_from_path(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        valid_chat_id(stem).then(|| stem.to_string())
    }

    pub fn load(&self, path: &Path) -> Result<TrackedChat> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let chat: TrackedChat = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if !valid_chat_id(&chat.chat_id) {
            anyhow::bail!("invalid chat id `{}` in {}", chat.chat_id, path.display());
        }
        if chat.listeners.is_empty() {
            anyhow::bail!("tracking record {} has no listeners", path.display());
        }
        Ok(chat)
    }

    pub fn load_all(&self) -> BTreeMap<String, TrackedChat> {
        let mut tracked = BTreeMap::new();
        let entries = match fs::read_dir(&self.tracked_dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %self.tracked_dir.display(), "tracking directory unreadable: {err}");
                return tracked;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if Self::chat_id_from_path(&path).is_none() {
                continue;
            }
            match self.load(&path) {
                Ok(chat) => {
                    tracked.insert(chat.chat_id.clone(), chat);
                }
                Err(err) => warn::emit(WarnEvent {
                    code: "RECORD_CORRUPT",
                    action: "skip-record",
                    chat: &path.display().to_string(),
                    session: "na",
                    reason: "parse-failed",
                    err: &format!("{err:#}"),
                }),
            }
        }
        tracked
    }

    pub fn save(&self, chat: &TrackedChat) -> Result<PathBuf> {
        if !valid_chat_id(&chat.chat_id) {
            anyhow::bail!("refusing to save tracking record with invalid chat id `{}`", chat.chat_id);
        }
        if chat.listeners.is_empty() {
            anyhow::bail!("refusing to save chat {} without listeners", chat.chat_id);
        }
        let path = self.path_for(&chat.chat_id);
        write_atomic(&path, |file| {
            serde_json::to_writer_pretty(&mut *file, chat)?;
            file.write_all(b"\n")?;
            Ok(())
        })?;
        Ok(path)
    }

    pub fn remove(&self, chat_id: &str) {
        let path = self.path_for(chat_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), "failed to remove tracking file: {err}"),
        }
    }

    pub fn cursor(&self, chat_id: &str, session_key: &str) -> SeenCursor {
        SeenCursor {
            path: self
                .chats_dir
                .join(chat_id)
                .join(".seen_indices")
                .join(safe_session_name(session_key)),
        }
    }
}

fn write_atomic(path: &Path, fill: impl FnOnce(&mut NamedTempFile) -> Result<()>) -> Result<()> {
    let parent = path.parent().context("state path has no parent")?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    fill(&mut temp)?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|e| anyhow::anyhow!("failed persisting {} atomically: {}", path.display(), e.error))?;
    Ok(())
}

/// File-name-safe form of a session key. When the underscore-joined name
/// has more than four segments its trailing segment is cut to eight
/// characters.
pub fn safe_session_name(session_key: &str) -> String {
    let joined = session_key.replace([':', '/', '\\'], "_");
    let mut parts: Vec<String> = joined.split('_').map(ToOwned::to_owned).collect();
    if parts.len() > 4
        && let Some(last) = parts.last_mut()
        && last.chars().count() > 8
    {
        *last = last.chars().take(8).collect();
    }
    parts.join("_")
}

/// Index of the last history message delivered to one listener.
#[derive(Debug, Clone)]
pub struct SeenCursor {
    path: PathBuf,
}

impl SeenCursor {
    /// `-1` when nothing was delivered yet or the file is unreadable.
    pub fn load(&self) -> i64 {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(-1)
    }

    pub fn save(&self, index: i64) -> Result<()> {
        write_atomic(&self.path, |file| {
            file.write_all(index.to_string().as_bytes())?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
