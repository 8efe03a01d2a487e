//! PQDROP wire protocol
//!
//! Discrete tagged messages exchanged over an externally supplied transport,
//! postcard-encoded inside a length-prefixed frame.

use crate::crypto::{HASH_LEN, NONCE_LEN};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// PQDROP protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header length: version byte + payload length (u32, big-endian)
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound on a single frame payload (largest chunk tier plus overhead)
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Metadata describing one file being moved
///
/// Immutable once sent; both sides must agree on it before any chunk is
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Transfer identifier, shared by both legs and by resume state
    pub transfer_id: Uuid,
    /// File name bytes; AEAD-sealed (nonce-prefixed) when `name_encrypted`
    pub name: Vec<u8>,
    /// Whether `name` is encrypted
    pub name_encrypted: bool,
    /// Declared file size in bytes
    pub size: u64,
    /// Total chunk count, `ceil(size / chunk_size)`
    pub total_chunks: u32,
    /// Whole-file content hash
    pub file_hash: [u8; HASH_LEN],
    /// Relative path for folder transfers
    pub path: Option<String>,
}

/// One encrypted file piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// 0-based chunk index
    pub index: u32,
    /// AEAD ciphertext (plaintext length + 16-byte tag)
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce, unique within its session/key-generation
    pub nonce: [u8; NONCE_LEN],
    /// Content hash of the *plaintext*
    pub plaintext_hash: [u8; HASH_LEN],
}

impl ChunkMessage {
    /// Validate receipt constraints against the agreed transfer parameters
    pub fn validate(&self, total_chunks: u32, max_ciphertext: usize) -> Result<()> {
        if self.index >= total_chunks {
            return Err(Error::Protocol(format!(
                "chunk index {} out of range (total {})",
                self.index, total_chunks
            )));
        }
        if self.ciphertext.len() > max_ciphertext {
            return Err(Error::Protocol(format!(
                "chunk ciphertext too large: {} bytes (max {})",
                self.ciphertext.len(),
                max_ciphertext
            )));
        }
        Ok(())
    }
}

/// PQDROP wire messages
///
/// Closed sum type over the protocol's message table; receivers match
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Combined post-quantum + classical public key (handshake, first flight)
    PublicKey {
        /// Session identifier chosen by the initiator
        session_id: Uuid,
        /// ML-KEM-768 public key followed by the X25519 public key
        public_key: Vec<u8>,
        /// Argon2 salt when the transfer is password-protected
        password_salt: Option<[u8; 16]>,
    },
    /// Encapsulation ciphertext (handshake, second flight)
    KeyExchange {
        /// Session identifier echoed from the first flight
        session_id: Uuid,
        /// ML-KEM ciphertext followed by the ephemeral X25519 public key
        ciphertext: Vec<u8>,
    },
    /// Announcement of a new key generation, mid-transfer
    KeyRotation {
        /// Session identifier
        session_id: Uuid,
        /// The new generation number
        generation: u32,
    },
    /// File description, sender to receiver, once
    FileMetadata(FileMetadata),
    /// Encrypted file piece, sender to receiver, repeated
    Chunk(ChunkMessage),
    /// Per-chunk acknowledgment, receiver to sender
    Ack {
        /// Acknowledged chunk index
        index: u32,
    },
    /// Human-readable failure report, either direction
    Error {
        /// Reason string
        reason: String,
    },
    /// Transfer completion notice, receiver to sender, once
    Complete {
        /// Whether the whole-file hash verified
        success: bool,
    },
    /// Request to resume an interrupted transfer
    ResumeRequest {
        /// Transfer identifier from the original metadata
        transfer_id: Uuid,
    },
    /// Reply carrying the peer's chunk bitmap
    ResumeResponse {
        /// Transfer identifier
        transfer_id: Uuid,
        /// Exported chunk bitmap, `ceil(total/8)` bytes
        bitmap: Vec<u8>,
        /// Whether the peer still holds resumable state
        can_resume: bool,
    },
    /// Request for a specific set of missing chunks
    ResumeChunkRequest {
        /// Transfer identifier
        transfer_id: Uuid,
        /// Missing chunk indices, ascending
        indices: Vec<u32>,
    },
}

impl Message {
    /// Wire tag of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PublicKey { .. } => "public-key",
            Message::KeyExchange { .. } => "key-exchange",
            Message::KeyRotation { .. } => "key-rotation",
            Message::FileMetadata(_) => "file-metadata",
            Message::Chunk(_) => "chunk",
            Message::Ack { .. } => "ack",
            Message::Error { .. } => "error",
            Message::Complete { .. } => "complete",
            Message::ResumeRequest { .. } => "resume-request",
            Message::ResumeResponse { .. } => "resume-response",
            Message::ResumeChunkRequest { .. } => "resume-chunk-request",
        }
    }
}

/// Peer-reported recoverable chunk failure
///
/// The `error` payload is a bare reason string; a hash-mismatch report is
/// encoded as `chunk <index> hash mismatch` so the sender can schedule a
/// bounded resend instead of failing the session.
pub fn chunk_error_reason(index: u32) -> String {
    format!("chunk {} hash mismatch", index)
}

/// Parse a peer error reason back into a resendable chunk index
pub fn parse_chunk_error(reason: &str) -> Option<u32> {
    let rest = reason.strip_prefix("chunk ")?;
    let (index, tail) = rest.split_once(' ')?;
    if tail != "hash mismatch" {
        return None;
    }
    index.parse().ok()
}

/// Serialize a message into a length-prefixed frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame payload too large: {} bytes",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a frame header, returning the payload length
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
    if header[0] != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported protocol version: {}",
            header[0]
        )));
    }
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame payload too large: {} bytes",
            length
        )));
    }
    Ok(length)
}

/// Deserialize a frame payload back into a message
pub fn decode_frame_payload(payload: &[u8]) -> Result<Message> {
    Ok(postcard::from_bytes(payload)?)
}
