//! Error types for the PQDROP transfer engine

use thiserror::Error;

/// Result type for PQDROP operations
pub type Result<T> = std::result::Result<T, Error>;

/// PQDROP-specific error types
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake timed out, was malformed, or decapsulation failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// A chunk decrypted to bytes whose hash does not match the declared hash
    #[error("Chunk {index} hash mismatch")]
    ChunkHashMismatch {
        /// Index of the offending chunk
        index: u32,
    },

    /// A chunk was not acknowledged within its retry budget
    #[error("Chunk {index} timed out after {attempts} attempts")]
    ChunkTimeout {
        /// Index of the unacknowledged chunk
        index: u32,
        /// Number of send attempts made
        attempts: u32,
    },

    /// Assembly was attempted before every chunk arrived
    #[error("Incomplete transfer: {received} of {total} chunks present")]
    IncompleteTransfer {
        /// Chunks received so far
        received: u32,
        /// Total chunks expected
        total: u32,
    },

    /// The reassembled file's hash does not match the declared file hash
    #[error("Whole-file hash mismatch after reassembly")]
    FileHashMismatch,

    /// Group recipient list validation failure
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Resume attempted against state past its retention window
    #[error("Transfer expired: {0}")]
    TransferExpired(String),

    /// Rejected session state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// State the session was in
        from: &'static str,
        /// State that was requested
        to: &'static str,
    },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Protocol violation or invalid message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport channel error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Resume/key-value store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The session was cancelled by the caller
    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Protocol(format!("Serialization error: {}", err))
    }
}

impl Error {
    /// Whether the condition is recoverable by a bounded chunk-level resend
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ChunkHashMismatch { .. } | Error::ChunkTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "test");
        let err: Error = io_error.into();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ChunkHashMismatch { index: 3 }.is_recoverable());
        assert!(Error::ChunkTimeout {
            index: 3,
            attempts: 3
        }
        .is_recoverable());
        assert!(!Error::FileHashMismatch.is_recoverable());
        assert!(!Error::KeyExchangeFailed("timeout".into()).is_recoverable());
    }

    #[test]
    fn test_display_includes_index() {
        let err = Error::ChunkHashMismatch { index: 17 };
        assert!(err.to_string().contains("17"));
    }
}
