use crate::error::AuthSourceError;
use crate::openclaw::config::{lookup_dotted_string, read_config_value};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Where a gateway bearer token comes from. Stored in tracking records as
/// `env:VAR`, `config:dotted.path` or `literal:value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuthSource {
    Env(String),
    Config(String),
    Literal(String),
}

impl AuthSource {
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Config(_) => {
                let paths = crate::openclaw::paths::resolve_paths().ok()?;
                self.resolve_with_config(&paths.config_path)
            }
            _ => self.resolve_with_config(Path::new("")),
        }
    }

    pub fn resolve_with_config(&self, config_path: &Path) -> Option<String> {
        let token = match self {
            Self::Env(var) => env::var(var).ok(),
            Self::Config(dotted) => match read_config_value(config_path) {
                Ok(root) => lookup_dotted_string(&root, dotted),
                Err(err) => {
                    tracing::warn!(config = %config_path.display(), "gateway auth config unreadable: {err:#}");
                    None
                }
            },
            Self::Literal(value) => Some(value.clone()),
        };
        token.filter(|t| !t.trim().is_empty())
    }
}

impl FromStr for AuthSource {
    type Err = AuthSourceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AuthSourceError::Empty);
        }
        let parsed = if let Some(var) = trimmed.strip_prefix("env:") {
            Self::Env(var.to_string())
        } else if let Some(path) = trimmed.strip_prefix("config:") {
            Self::Config(path.to_string())
        } else if let Some(value) = trimmed.strip_prefix("literal:") {
            Self::Literal(value.to_string())
        } else {
            return Err(AuthSourceError::Unsupported(trimmed.to_string()));
        };
        Ok(parsed)
    }
}

impl TryFrom<String> for AuthSource {
    type Error = AuthSourceError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<AuthSource> for String {
    fn from(source: AuthSource) -> Self {
        source.to_string()
    }
}

impl fmt::Display for AuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(var) => write!(f, "env:{var}"),
            Self::Config(path) => write!(f, "config:{path}"),
            Self::Literal(value) => write!(f, "literal:{value}"),
        }
    }
}
