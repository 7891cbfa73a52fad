//! Error types for decoder pool operations.
//!
//! Callers see one of three outcomes: a translation, a pass-through copy,
//! or one of the typed errors below. Transport failures from a worker
//! process are folded into [`DecoderError::WorkerUnavailable`] before they
//! leave the crate.

use thiserror::Error;

use crate::model::LanguageDirection;

/// Errors that can occur while dispatching work to decoder processes.
#[derive(Debug, Clone, Error)]
pub enum DecoderError {
    /// The pool is shutting down or has no alive workers.
    #[error("No alive decoder processes available")]
    NoWorkersAvailable,

    /// A worker process crashed or stopped answering.
    #[error("Decoder process unavailable: {0}")]
    WorkerUnavailable(String),

    /// The worker answered with a structured failure for this request.
    /// The process itself is still alive.
    #[error("Decoder failure ({kind}){}", detail(.message))]
    Worker {
        kind: String,
        message: Option<String>,
    },

    #[error("Unsupported language direction: {0}")]
    UnsupportedDirection(LanguageDirection),

    /// Fatal: the pool could not bring up its workers.
    #[error("Decoder pool initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl DecoderError {
    /// Whether the error means the worker (or the whole pool) is gone,
    /// as opposed to a failure specific to one request's content.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DecoderError::NoWorkersAvailable | DecoderError::WorkerUnavailable(_)
        )
    }
}

impl From<std::io::Error> for DecoderError {
    fn from(e: std::io::Error) -> Self {
        DecoderError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for DecoderError {
    fn from(e: serde_json::Error) -> Self {
        DecoderError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for DecoderError {
    fn from(e: serde_yaml::Error) -> Self {
        DecoderError::Yaml(e.to_string())
    }
}

fn detail(message: &Option<String>) -> String {
    message
        .as_ref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

/// Result type alias for decoder operations.
pub type Result<T> = std::result::Result<T, DecoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecoderError::NoWorkersAvailable;
        assert!(err.to_string().contains("No alive"));

        let err = DecoderError::Worker {
            kind: "OutOfMemory".to_string(),
            message: Some("CUDA".to_string()),
        };
        assert_eq!(err.to_string(), "Decoder failure (OutOfMemory): CUDA");

        let err = DecoderError::Worker {
            kind: "BadInput".to_string(),
            message: None,
        };
        assert_eq!(err.to_string(), "Decoder failure (BadInput)");

        let err = DecoderError::UnsupportedDirection(LanguageDirection::new("en", "xx"));
        assert!(err.to_string().contains("en-xx"));
    }

    #[test]
    fn test_is_unavailable() {
        assert!(DecoderError::NoWorkersAvailable.is_unavailable());
        assert!(DecoderError::WorkerUnavailable("timeout".into()).is_unavailable());
        assert!(!DecoderError::Worker {
            kind: "x".into(),
            message: None
        }
        .is_unavailable());
        assert!(!DecoderError::Config("x".into()).is_unavailable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DecoderError = io.into();
        assert!(matches!(err, DecoderError::Io(ref m) if m.contains("missing")));
    }
}
