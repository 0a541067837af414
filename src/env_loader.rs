use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvLoadOutcome {
    LoadedDefault,
    LoadedFallback(PathBuf),
    Missing,
}

fn fallback_dotenv_path(relay_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match relay_home.filter(|p| !p.as_os_str().is_empty()) {
        Some(relay_home) => Some(relay_home.join(".env")),
        None => Some(home_dir?.join(".chat-relay/.env")),
    }
}

/// `.env` in the working directory wins; otherwise the one under the relay
/// home is tried.
pub fn load_dotenv() -> DotenvLoadOutcome {
    if dotenvy::dotenv().is_ok() {
        return DotenvLoadOutcome::LoadedDefault;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("CHAT_RELAY_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return DotenvLoadOutcome::Missing;
    };
    if path.is_file() && dotenvy::from_path(&path).is_ok() {
        return DotenvLoadOutcome::LoadedFallback(path);
    }

    DotenvLoadOutcome::Missing
}
