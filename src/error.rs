use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Error Handling ---

/// Every failure the inference core can report.
///
/// Validation errors (`InvalidModel`, `InvalidPrompt`, `AlreadyConnecting`,
/// `NotConnected`, `GenerationInProgress`) are returned before any state
/// changes. The rest end a connect probe or a generation session in a failed
/// terminal state that carries the kind for display.
///
/// An empty model catalog is not an error: `list_models` returns an empty list.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("Invalid model: model name must not be empty")]
    InvalidModel,
    #[error("Invalid prompt: prompt must not be empty")]
    InvalidPrompt,
    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("No model connected")]
    NotConnected,
    #[error("A generation is already in progress for this conversation")]
    GenerationInProgress,
    #[error("Backend unreachable{}: {reason}", status_suffix(.status))]
    Unreachable { status: Option<u16>, reason: String },
    #[error("Backend rejected the request{}: {message}", status_suffix(.status))]
    BackendRejected { status: Option<u16>, message: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Malformed stream chunk: {0}")]
    MalformedChunk(String),
    #[error("Stream ended before the backend signalled completion")]
    StreamTruncated,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {})", code),
        None => String::new(),
    }
}

impl ErrorKind {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        ErrorKind::Unreachable {
            status: None,
            reason: reason.into(),
        }
    }

    /// True for errors raised by input validation rather than by the backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidModel
                | ErrorKind::InvalidPrompt
                | ErrorKind::AlreadyConnecting
                | ErrorKind::NotConnected
                | ErrorKind::GenerationInProgress
        )
    }
}

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Timed out waiting for the backend")]
    Timeout,
    #[error("Body read failed: {0}")]
    Body(String),
}

impl From<TransportError> for ErrorKind {
    fn from(err: TransportError) -> Self {
        ErrorKind::unreachable(err.to_string())
    }
}
