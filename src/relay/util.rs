use anyhow::Result;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// RFC 3339 timestamp used in tracking records.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Keeps at most `max_chars` characters; longer input is cut to
/// `max_chars - 3` and suffixed with `...`.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    if clean.chars().count() <= max_chars {
        return clean;
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = clean.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// A zombie still answers `kill -0`; it counts as gone.
pub fn pid_alive(pid: u32) -> bool {
    let mut kill_cmd = Command::new("kill");
    kill_cmd.arg("-0").arg(pid.to_string());
    match run_command_with_optional_timeout(&mut kill_cmd, Some(2)) {
        Ok(output) if output.status.success() => {}
        _ => return false,
    }

    let mut ps_cmd = Command::new("ps");
    ps_cmd.arg("-p").arg(pid.to_string()).arg("-o").arg("stat=");
    let Ok(output) = run_command_with_optional_timeout(&mut ps_cmd, Some(2)) else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    !String::from_utf8_lossy(&output.stdout)
        .trim()
        .starts_with('Z')
}

pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout_secs: Option<u64>,
) -> Result<Output> {
    let Some(timeout_secs) = timeout_secs else {
        return Ok(cmd.output()?);
    };
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let started = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("command timed out after {}s", timeout_secs);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_with_ellipsis("Searching sources", 100), "Searching sources");
    }

    #[test]
    fn long_text_keeps_97_chars_and_dots() {
        let long = "x".repeat(150);
        let out = truncate_with_ellipsis(&long, 100);
        assert_eq!(out.chars().count(), 100);
        assert!(out.ends_with("..."));
        assert!(out.starts_with(&"x".repeat(97)));
    }

    #[test]
    fn newlines_collapse_to_spaces() {
        assert_eq!(truncate_with_ellipsis("a\nb", 10), "a b");
    }

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    #[cfg(not(windows))]
    fn running_process_is_alive_and_unreaped_exit_is_not() {
        let mut running = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        assert!(pid_alive(running.id()));
        let _ = running.kill();
        let _ = running.wait();

        let mut exited = Command::new("true").spawn().expect("spawn true");
        thread::sleep(Duration::from_millis(300));
        assert!(!pid_alive(exited.id()));
        let _ = exited.wait();
    }
}
