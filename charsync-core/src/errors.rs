//! Error types for the synchronization engine

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Operation attempted while the session is not `Connected`
    #[error("Not connected to the sync service")]
    NotConnected,

    /// Connect or reconnect ran out of attempts
    #[error("Handshake failed after {attempts} attempts: {reason}")]
    HandshakeFailed { attempts: u32, reason: String },

    /// A download stream ended before the declared size arrived
    #[error("Transfer of {hash} incomplete: {received} of {expected} bytes")]
    TransferIncomplete {
        hash: String,
        received: u64,
        expected: u64,
    },

    /// The service answered an RPC with an error
    #[error("Remote rejected {method}: {message}")]
    RemoteRejected { method: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A referenced content hash has no local file
    #[error("Content not found locally: {0}")]
    ContentMissing(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn rejected(method: &str, message: impl Into<String>) -> Self {
        SyncError::RemoteRejected {
            method: method.to_string(),
            message: message.into(),
        }
    }

    /// Errors that mean the underlying channel is gone, as opposed to a
    /// failure of the single request
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SyncError::NotConnected | SyncError::ChannelClosed(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            SyncError::Cancelled
        } else {
            SyncError::Storage(format!("blocking task failed: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::TransferIncomplete {
            hash: "ab12".to_string(),
            received: 10,
            expected: 20,
        };
        assert_eq!(err.to_string(), "Transfer of ab12 incomplete: 10 of 20 bytes");

        let err = SyncError::rejected("push_snapshot", "unknown peer");
        assert_eq!(err.to_string(), "Remote rejected push_snapshot: unknown peer");
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<String>("not json").unwrap_err();
        assert!(matches!(SyncError::from(json_err), SyncError::Serialization(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(SyncError::from(io_err), SyncError::Storage(_)));

        let config_err = ConfigError::Invalid("x".to_string());
        assert!(matches!(SyncError::from(config_err), SyncError::Config(_)));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(SyncError::NotConnected.is_disconnect());
        assert!(SyncError::ChannelClosed("eof".into()).is_disconnect());
        assert!(!SyncError::Cancelled.is_disconnect());
    }
}
