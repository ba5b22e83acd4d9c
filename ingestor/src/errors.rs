use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already running: {0}")]
    Busy(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a broker connection. The variant decides how the
/// connection manager recovers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Connect timeout, keep-alive expiry, socket reset.
    #[error("transport timeout: {0}")]
    Timeout(String),

    /// The broker rejected the protocol version or sent a frame we cannot parse.
    #[error("protocol incompatibility: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, BrokerError::Protocol(_))
    }
}
