//! Error types for Torrentium

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Chunk {index} failed verification: expected {expected}, got {actual}")]
    Corruption {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Download of {id} failed: {reason}")]
    DownloadFailed { id: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u32 },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: u32, message: String },
}

impl Error {
    /// Errors that the owning component retries internally rather than
    /// surfacing to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::Timeout(_)
                | Error::Corruption { .. }
                | Error::Remote { .. }
                | Error::Decode(_)
                | Error::Protocol(_)
        )
    }

    /// Errors caused by the peer being unreachable; these feed the health
    /// monitor's failure counter.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionFailed(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
