//! Error types for the container agent.

use kled_protocol::{error_codes, MuxError};

/// Result alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Container agent errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] MuxError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A required lifecycle hook failed.
    #[error("required hook '{name}' failed: {message}")]
    Hook { name: String, message: String },

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("credential request failed: {0}")]
    Credentials(String),

    #[error("invalid workspace info: {0}")]
    InvalidInfo(String),
}

impl Error {
    /// Wire code reported upstream for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Hook { .. } => error_codes::HOOK_FAILED,
            Error::Transport(_) => error_codes::TRANSPORT,
            Error::InvalidInfo(_) => error_codes::INVALID_REQUEST,
            _ => error_codes::BOOTSTRAP_FAILED,
        }
    }
}
