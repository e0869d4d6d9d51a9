use thiserror::Error;

/// Errors produced by the policy execution core.
///
/// `UnsupportedPlatform`, `Integrity` and `ServiceUnavailable` are fatal to
/// backend construction; everything else is scoped to a single checker and
/// never aborts sibling checkers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("evaluator checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("evaluation service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("policy evaluation failed: {0}")]
    Evaluation(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("provider failed: {0}")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error kills the whole backend rather than one checker.
    pub fn is_fatal_to_backend(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedPlatform { .. } | Error::Integrity { .. } | Error::ServiceUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_fatal_classification() {
        let fatal = Error::ServiceUnavailable("connection refused".into());
        assert!(fatal.is_fatal_to_backend());

        let scoped = Error::Evaluation("exit code 3".into());
        assert!(!scoped.is_fatal_to_backend());
    }
}
