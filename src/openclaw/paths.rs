use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OpenClawPaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Ok(val) = env::var("OPENCLAW_HOME") {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }

    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

pub fn resolve_paths() -> Result<OpenClawPaths> {
    let home = required_home_dir()?;

    let state_dir = match env::var("OPENCLAW_STATE_DIR") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => home.join(".openclaw"),
    };

    let config_path = match env::var("OPENCLAW_CONFIG_PATH") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => state_dir.join("openclaw.json"),
    };

    Ok(OpenClawPaths {
        state_dir,
        config_path,
    })
}
