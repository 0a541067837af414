use thiserror::Error;

/// Upstream conditions that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("client version too old: {current_version} < {minimum_version}")]
    VersionTooOld {
        current_version: String,
        minimum_version: String,
    },
    #[error("authorization rejected: {0}")]
    AuthRejected(String),
    #[error("payment required")]
    PaymentRequired,
    #[error("{0}")]
    Other(String),
}

impl FatalError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionTooOld { .. } => "version-too-old",
            Self::AuthRejected(_) => "auth-rejected",
            Self::PaymentRequired => "payment-required",
            Self::Other(_) => "unclassified",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("transient upstream failure: {0}")]
    Transient(String),
}

impl UpstreamError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthSourceError {
    #[error("auth source is empty")]
    Empty,
    #[error("unsupported auth source `{0}`: use env:<VAR>, config:<dotted.path> or literal:<value>")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_stable_strings() {
        assert_eq!(FatalError::PaymentRequired.kind(), "payment-required");
        assert_eq!(
            FatalError::AuthRejected("x".into()).kind(),
            "auth-rejected"
        );
        assert_eq!(FatalError::Other("boom".into()).kind(), "unclassified");
    }

    #[test]
    fn fatal_converts_into_upstream_error() {
        let err: UpstreamError = FatalError::PaymentRequired.into();
        assert!(matches!(err, UpstreamError::Fatal(FatalError::PaymentRequired)));
    }
}
