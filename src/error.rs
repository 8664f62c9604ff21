//! Error types for kled.

use kled_protocol::{error_codes, MuxError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How a provider failure should be handled by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, rate limits. Retried with backoff.
    Transient,
    /// The machine changed under us. Status is re-read and the call retried once.
    Inconsistent,
    /// Everything else.
    Fatal,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::Inconsistent => write!(f, "inconsistent"),
            ProviderErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// A failed machine lifecycle call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider '{provider}' failed to {operation} ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub operation: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        operation: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(provider, operation, ProviderErrorKind::Fatal, message)
    }

    /// Build an error from provider command output, classifying it.
    pub fn classify(
        provider: impl Into<String>,
        operation: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        let message = output.into();
        let kind = classify_output(&message);
        Self::new(provider, operation, kind, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Classify provider output into a failure kind.
pub fn classify_output(output: &str) -> ProviderErrorKind {
    let lower = output.to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "rate limit",
        "too many requests",
        "service unavailable",
        "temporarily unavailable",
        "connection reset",
        "try again",
    ];
    // matched as whole words only, so IDs and ports containing the digits
    // don't count
    const TRANSIENT_STATUS: &[&str] = &["429", "503"];
    const INCONSISTENT: &[&str] = &["not found", "does not exist", "no such", "notfound"];

    let status = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| TRANSIENT_STATUS.contains(&word));
    if status || TRANSIENT.iter().any(|p| lower.contains(p)) {
        ProviderErrorKind::Transient
    } else if INCONSISTENT.iter().any(|p| lower.contains(p)) {
        ProviderErrorKind::Inconsistent
    } else {
        ProviderErrorKind::Fatal
    }
}

/// A required lifecycle hook failed inside the container.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
}

/// Error type for kled operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Machine lifecycle failure, after retries.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Image build failed. Never retried.
    #[error("image build failed:\n{log}")]
    Build {
        fingerprint: Option<String>,
        log: String,
    },

    /// Host or container agent failed to start.
    #[error("bootstrap failed in {hop}: {message}")]
    Bootstrap { hop: String, message: String },

    /// A required lifecycle hook failed.
    #[error("bootstrap failed: required hook failed: {0}")]
    Hook(HookError),

    /// The multiplexed transport broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// Container runtime failure.
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("agent error: {0}")]
    Agent(#[from] kled_agent::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<MuxError> for Error {
    fn from(e: MuxError) -> Self {
        Error::Transport(e.to_string())
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    pub fn bootstrap(hop: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Bootstrap {
            hop: hop.into(),
            message: message.into(),
        }
    }

    /// Whether this is a bootstrap failure (including required hooks).
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Error::Bootstrap { .. } | Error::Hook(_))
    }

    /// Wire code used when reporting this error to the previous hop.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Provider(_) => error_codes::PROVIDER_FAILED,
            Error::Build { .. } => error_codes::BUILD_FAILED,
            Error::Hook(_) => error_codes::HOOK_FAILED,
            Error::Transport(_) | Error::Cancelled => error_codes::TRANSPORT,
            Error::Agent(e) => e.code(),
            _ => error_codes::BOOTSTRAP_FAILED,
        }
    }

    /// Rebuild an error reported by an inner hop.
    ///
    /// The message is kept verbatim; `hop` names the hop that reported it.
    pub fn from_wire(hop: &str, code: Option<&str>, message: String) -> Self {
        match code {
            Some(error_codes::BUILD_FAILED) => Error::Build {
                fingerprint: None,
                log: message,
            },
            Some(error_codes::PROVIDER_FAILED) => {
                Error::Provider(ProviderError::fatal(hop, "run agent", message))
            }
            Some(error_codes::HOOK_FAILED) => Error::Hook(HookError { message }),
            Some(error_codes::TRANSPORT) => Error::Transport(format!("{}: {}", hop, message)),
            _ => Error::bootstrap(hop, message),
        }
    }

    /// Attribute `err` to `hop`.
    ///
    /// Build, hook, provider and transport failures keep their kind; anything
    /// else becomes a bootstrap failure of `hop`.
    pub fn hop(hop: &str, err: Error) -> Self {
        match err {
            e @ (Error::Build { .. }
            | Error::Hook(_)
            | Error::Provider(_)
            | Error::Transport(_)
            | Error::Cancelled
            | Error::Bootstrap { .. }) => e,
            other => Error::bootstrap(hop, other.to_string()),
        }
    }

    /// Message to send upstream, prefixed with the reporting hop.
    pub fn hop_message(&self, hop: &str) -> String {
        match self {
            Error::Build { log, .. } => log.clone(),
            Error::Hook(e) => e.message.clone(),
            Error::Bootstrap {
                hop: inner,
                message,
            } => format!("{}: {}: {}", hop, inner, message),
            other => format!("{}: {}", hop, other),
        }
    }
}
