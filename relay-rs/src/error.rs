use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    ProtocolSyntax(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Maximum input size exceeded ({0} bytes)")]
    SizeLimitExceeded(usize),

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Queue persistence error: {0}")]
    QueuePersistence(String),

    #[error("MX lookup failed: {0}")]
    RelayLookup(String),

    #[error("Relay delivery failed: {0}")]
    RelayDelivery(String),

    #[error("Relaying denied: {0}")]
    RelayDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Errors after which the session cannot continue reading from the client
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::Decode(_)
                | RelayError::SizeLimitExceeded(_)
                | RelayError::IdleTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
