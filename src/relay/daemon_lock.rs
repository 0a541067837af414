use crate::relay::paths::RelayPaths;
use crate::relay::util::now_epoch_secs;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockPayload {
    pub pid: u32,
    #[serde(default, alias = "start_time")]
    pub started_at_epoch_secs: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_uuid: String,
    #[serde(default)]
    pub relay_home: String,
}

/// `<package version>+<build id>`; a running daemon with a different marker
/// is replaced by `track`.
pub fn current_version_marker() -> String {
    format!("{}+{}", env!("CARGO_PKG_VERSION"), env!("BUILD_UUID"))
}

pub fn parse_daemon_lock_payload(raw: &str) -> Option<DaemonLockPayload> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(payload) = serde_json::from_str::<DaemonLockPayload>(trimmed) {
        return Some(payload);
    }

    // Plain pid files are still accepted.
    let pid = trimmed.lines().next()?.trim().parse::<u32>().ok()?;
    Some(DaemonLockPayload {
        pid,
        started_at_epoch_secs: 0,
        version: String::new(),
        build_uuid: String::new(),
        relay_home: String::new(),
    })
}

pub fn read_daemon_lock_payload(paths: &RelayPaths) -> Result<Option<DaemonLockPayload>> {
    if !paths.pid_file.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&paths.pid_file)
        .with_context(|| format!("failed to read pid file {}", paths.pid_file.display()))?;
    Ok(parse_daemon_lock_payload(&raw))
}

pub fn read_version_marker(paths: &RelayPaths) -> Option<String> {
    fs::read_to_string(&paths.version_file)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// True while some process holds the exclusive lock on the pid file.
pub fn lock_is_held(paths: &RelayPaths) -> bool {
    let Ok(file) = OpenOptions::new().read(true).open(&paths.pid_file) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(err) => err.kind() == ErrorKind::WouldBlock,
    }
}

/// Held for the daemon's lifetime. Dropping it releases the lock and removes
/// the pid and version files.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl DaemonLock {
    pub fn acquire(paths: &RelayPaths) -> Result<Self> {
        fs::create_dir_all(&paths.relay_home)
            .with_context(|| format!("failed to create {}", paths.relay_home.display()))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&paths.pid_file)
            .with_context(|| format!("failed to open pid file {}", paths.pid_file.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                anyhow::bail!(
                    "chat-relay daemon already running (lock: {})",
                    paths.pid_file.display()
                );
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to lock pid file {}", paths.pid_file.display())
                });
            }
        }

        let payload = DaemonLockPayload {
            pid: std::process::id(),
            started_at_epoch_secs: now_epoch_secs()?,
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_uuid: env!("BUILD_UUID").to_string(),
            relay_home: paths.relay_home.display().to_string(),
        };
        file.set_len(0)
            .with_context(|| format!("failed to truncate {}", paths.pid_file.display()))?;
        writeln!(&mut file, "{}", serde_json::to_string(&payload)?)
            .with_context(|| format!("failed to write {}", paths.pid_file.display()))?;
        fs::write(&paths.version_file, format!("{}\n", current_version_marker()))
            .with_context(|| format!("failed to write {}", paths.version_file.display()))?;

        Ok(Self {
            file,
            pid_file: paths.pid_file.clone(),
            version_file: paths.version_file.clone(),
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.pid_file);
        let _ = fs::remove_file(&self.version_file);
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_json_payload() {
        let raw = r#"{"pid":42,"started_at_epoch_secs":1700000000,"version":"0.1.0","build_uuid":"abc","relay_home":"/tmp/r"}"#;
        let payload = parse_daemon_lock_payload(raw).expect("payload");
        assert_eq!(payload.pid, 42);
        assert_eq!(payload.build_uuid, "abc");
    }

    #[test]
    fn parses_plain_pid_payload() {
        let payload = parse_daemon_lock_payload("4242\n").expect("payload");
        assert_eq!(payload.pid, 4242);
        assert!(payload.build_uuid.is_empty());
    }

    #[test]
    fn acquire_writes_files_and_drop_cleans_up() {
        let tmp = tempdir().expect("tempdir");
        let paths = RelayPaths::under(tmp.path().to_path_buf());

        let lock = DaemonLock::acquire(&paths).expect("acquire");
        let payload = read_daemon_lock_payload(&paths)
            .expect("read")
            .expect("payload present");
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(
            read_version_marker(&paths).as_deref(),
            Some(current_version_marker().as_str())
        );
        assert!(lock_is_held(&paths));
        assert!(DaemonLock::acquire(&paths).is_err());

        drop(lock);
        assert!(!paths.pid_file.exists());
        assert!(!paths.version_file.exists());
        assert!(!lock_is_held(&paths));
    }
}
