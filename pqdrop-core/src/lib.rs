//! PQDROP Core - Post-Quantum P2P File Transfer Engine
//!
//! This crate provides the transfer engine: hybrid post-quantum key
//! exchange, per-chunk authenticated encryption, bitmap-indexed resume,
//! adaptive bitrate control, and multi-recipient group sends. The hosting
//! application supplies the transport; the engine never dials or listens.

pub mod adaptive;
pub mod chunker;
pub mod crypto;
pub mod error;
pub mod group;
pub mod kex;
pub mod protocol;
pub mod resume;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use adaptive::{AdaptiveConfig, BitrateController, LinkProfile, NetworkSample};
pub use chunker::{FileChunker, Reassembler};
pub use crypto::{AeadAlgorithm, CryptoSuite, HashAlgorithm};
pub use error::{Error, Result};
pub use group::{validate_recipients, GroupConfig, GroupOutcome, GroupSend, GroupStatus};
pub use kex::{HandshakeConfig, HybridKeyPair, Role, SessionKeys, SharedSecret};
pub use protocol::{FileMetadata, Message, PROTOCOL_VERSION};
pub use resume::{ChunkBitmap, KvStore, MemoryKvStore, ResumeManager, ResumeRecord};
pub use session::{
    cancel_pair, CancelHandle, CancelToken, ReceivedFile, SessionConfig, SessionEvent,
    SessionStatus, TransferSession, TransferStats,
};
pub use transport::{memory_pair, FramedTransport, MemoryTransport, Transport};

/// Default chunk size for file transfers (64KB, the wide-area middle tier)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size any tier may select
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size any tier may select
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum chunks per transfer, bounding receiver bitmap and slot memory
pub const MAX_CHUNK_COUNT: u32 = 1 << 20;

/// Maximum recipients in one group send
pub const MAX_RECIPIENTS: usize = 10;

/// Per-chunk acknowledgment timeout in seconds
pub const ACK_TIMEOUT_SECS: u64 = 10;

/// Send attempts per chunk before the transfer fails permanently
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Handshake attempt timeout in seconds
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Handshake attempts before the session fails permanently
pub const HANDSHAKE_MAX_ATTEMPTS: u32 = 3;

/// Quiet-link timeout in seconds before a session pauses
pub const IDLE_TIMEOUT_SECS: u64 = 60;

/// Key rotation interval in seconds (5 minutes for forward secrecy)
pub const KEY_ROTATION_INTERVAL_SECS: u64 = 300;

/// Key rotation byte trigger (256MB under one generation)
pub const KEY_ROTATION_BYTES: u64 = 256 * 1024 * 1024;

/// Seconds the receiver honors the previous generation after a rotation
pub const KEY_ROTATION_GRACE_SECS: u64 = 30;
