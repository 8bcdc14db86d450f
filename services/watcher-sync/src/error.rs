//! Error types for the watcher sync client

/// Errors raised by the push channel, configuration and local storage
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Push channel is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Invocation of '{target}' failed: {message}")]
    InvocationFailed { target: String, message: String },

    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to send message: {0}")]
    SendError(String),

    #[error("Failed to receive response")]
    ReceiveError,

    #[error("Push channel closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A REST failure normalized to `{message, status}` before it reaches the
/// sync core or the front end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (status {status})")]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl ApiError {
    /// Message used when a failure carries no usable detail
    pub const UNEXPECTED: &'static str = "An unexpected error occurred";

    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    pub fn unexpected() -> Self {
        Self::new(Self::UNEXPECTED, 500)
    }

    /// The session token was rejected; recovery happens centrally
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Result type alias for watcher sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
