//! Transfer session engine
//!
//! Drives one file transfer end to end over a [`Transport`]: handshake,
//! chunk pipeline with windowed acknowledgments, key rotation, durable
//! resume, and cooperative cancellation. The sender is always the handshake
//! initiator; the receiver responds.

use crate::adaptive::{BitrateController, NetworkSample};
use crate::chunker::{ChunkPiece, FileChunker, Reassembler};
use crate::crypto::{self, RecvCipher, NONCE_LEN};
use crate::error::{Error, Result};
use crate::kex::{self, Role, SessionKeys, SharedSecret};
use crate::protocol::{
    chunk_error_reason, parse_chunk_error, ChunkMessage, FileMetadata, Message,
};
use crate::resume::{ChunkBitmap, Disposition, ResumeManager, ResumeRecord};
use crate::transport::Transport;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant as TokioInstant;
use uuid::Uuid;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionStatus {
    /// Created, handshake not started
    Pending,
    /// Key exchange in progress
    Negotiating,
    /// Chunks moving
    Transferring,
    /// Interrupted with resumable state persisted
    Paused,
    /// Finished and verified
    Completed,
    /// Failed permanently
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl SessionStatus {
    /// Stable name, used in errors and logs
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Negotiating => "negotiating",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this state accepts no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal lifecycle step
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Negotiating)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Negotiating, Transferring)
                | (Negotiating, Failed)
                | (Negotiating, Cancelled)
                | (Transferring, Completed)
                | (Transferring, Paused)
                | (Transferring, Failed)
                | (Transferring, Cancelled)
                | (Paused, Negotiating)
                | (Paused, Transferring)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

fn transition(status: &mut SessionStatus, to: SessionStatus) -> Result<()> {
    if !status.can_transition(to) {
        return Err(Error::InvalidStateTransition {
            from: status.as_str(),
            to: to.as_str(),
        });
    }
    tracing::debug!(from = status.as_str(), to = to.as_str(), "session transition");
    *status = to;
    Ok(())
}

/// Cancel signal consumed by a session
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pends forever if the handle
    /// was dropped without cancelling
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Caller-held side of a cancel pair
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation of every session holding the paired token
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Shared chunk-level progress counter, safe to poll from other tasks
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicU32,
    total: AtomicU32,
}

impl Progress {
    fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn record(&self, done: u32) {
        self.done.store(done, Ordering::Relaxed);
    }

    /// `(done, total)` chunk counts
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Completed fraction in `[0, 1]`; zero-chunk transfers report 1
    pub fn fraction(&self) -> f64 {
        let (done, total) = self.snapshot();
        if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        }
    }
}

/// Events emitted while a session runs
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        transfer_id: Uuid,
        total_chunks: u32,
    },
    ChunkTransferred {
        transfer_id: Uuid,
        index: u32,
        completed: u32,
        total: u32,
    },
    KeyRotated {
        transfer_id: Uuid,
        generation: u32,
    },
    Paused {
        transfer_id: Uuid,
    },
    Completed {
        transfer_id: Uuid,
    },
    Failed {
        transfer_id: Uuid,
        reason: String,
    },
}

async fn emit(events: Option<&mpsc::Sender<SessionEvent>>, event: SessionEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

/// Session tuning parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake driver parameters
    pub handshake: kex::HandshakeConfig,
    /// Bitrate controller parameters (also selects the link profile)
    pub adaptive: crate::adaptive::AdaptiveConfig,
    /// Fixed chunk size; `None` takes the controller's current tier
    pub chunk_size: Option<usize>,
    /// AEAD-seal the file name inside the metadata message
    pub encrypt_name: bool,
    /// Per-chunk acknowledgment timeout
    pub ack_timeout: Duration,
    /// Send attempts per chunk before the transfer fails
    pub max_chunk_attempts: u32,
    /// Quiet-link timeout before the session pauses
    pub idle_timeout: Duration,
    /// Key rotation trigger: wall-clock interval
    pub rotation_interval: Duration,
    /// Key rotation trigger: bytes under one generation
    pub rotation_bytes: u64,
    /// How long the receiver honors the previous generation after rotating
    pub rotation_grace: Duration,
    /// Hard cap on send rate in bytes/sec, on top of the controller
    pub bandwidth_limit: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake: kex::HandshakeConfig::default(),
            adaptive: crate::adaptive::AdaptiveConfig::default(),
            chunk_size: None,
            encrypt_name: false,
            ack_timeout: Duration::from_secs(crate::ACK_TIMEOUT_SECS),
            max_chunk_attempts: crate::MAX_CHUNK_ATTEMPTS,
            idle_timeout: Duration::from_secs(crate::IDLE_TIMEOUT_SECS),
            rotation_interval: Duration::from_secs(crate::KEY_ROTATION_INTERVAL_SECS),
            rotation_bytes: crate::KEY_ROTATION_BYTES,
            rotation_grace: Duration::from_secs(crate::KEY_ROTATION_GRACE_SECS),
            bandwidth_limit: None,
        }
    }
}

/// Counters for one finished (or interrupted) transfer leg
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferStats {
    pub transfer_id: Uuid,
    /// Plaintext bytes moved this run
    pub bytes: u64,
    /// Chunks acknowledged this run
    pub chunks: u32,
    /// Chunk resends (timeouts plus hash-mismatch reports)
    pub retries: u32,
    /// Key rotations performed
    pub rotations: u32,
    /// Wall-clock duration of this run
    pub elapsed: Duration,
}

impl TransferStats {
    fn new(transfer_id: Uuid) -> Self {
        Self {
            transfer_id,
            bytes: 0,
            chunks: 0,
            retries: 0,
            rotations: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// A fully received and verified file
#[derive(Debug)]
pub struct ReceivedFile {
    /// Metadata as received (name still sealed if it was sent sealed)
    pub metadata: FileMetadata,
    /// Decrypted file name bytes
    pub name: Vec<u8>,
    /// Verified file content
    pub data: Bytes,
    /// Receive-side counters
    pub stats: TransferStats,
}

fn chunk_aad(transfer_id: Uuid, index: u32) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(transfer_id.as_bytes());
    aad[16..].copy_from_slice(&index.to_be_bytes());
    aad
}

fn advance_secret(mut secret: SharedSecret, from: u32, to: u32) -> Result<SharedSecret> {
    if to < from {
        return Err(Error::Protocol(format!(
            "key generation regressed: {} -> {}",
            from, to
        )));
    }
    for generation in (from + 1)..=to {
        secret = kex::rotate_secret(&secret, generation);
    }
    Ok(secret)
}

struct Flight {
    attempts: u32,
    deadline: TokioInstant,
    sent_at: Instant,
}

struct Pacer {
    window_start: Instant,
    bytes: u64,
}

impl Pacer {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes: 0,
        }
    }

    async fn pace(&mut self, bytes: u64, rate: u64) {
        if rate == 0 {
            return;
        }
        self.bytes += bytes;
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let ahead = self.bytes as f64 - rate as f64 * elapsed;
        if ahead > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(ahead / rate as f64)).await;
        }
        if elapsed > 2.0 {
            self.window_start = Instant::now();
            self.bytes = 0;
        }
    }
}

async fn send_chunk<T: Transport>(
    transport: &mut T,
    keys: &mut SessionKeys,
    transfer_id: Uuid,
    piece: &ChunkPiece,
) -> Result<u64> {
    let aad = chunk_aad(transfer_id, piece.index);
    let (nonce, ciphertext) = keys.send.encrypt(&piece.data, &aad)?;
    transport
        .send(Message::Chunk(ChunkMessage {
            index: piece.index,
            ciphertext,
            nonce,
            plaintext_hash: piece.hash,
        }))
        .await?;
    Ok(piece.data.len() as u64)
}

/// One P2P transfer leg over an externally supplied transport
pub struct TransferSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    status: SessionStatus,
    controller: BitrateController,
    events: Option<mpsc::Sender<SessionEvent>>,
    cancel: CancelToken,
    resume: Option<ResumeManager>,
    progress: Arc<Progress>,
}

impl<T: Transport> TransferSession<T> {
    /// Wrap an open transport in an idle session
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let controller = BitrateController::new(config.adaptive.clone());
        let (_handle, cancel) = cancel_pair();
        Self {
            transport,
            config,
            status: SessionStatus::Pending,
            controller,
            events: None,
            cancel,
            resume: None,
            progress: Arc::new(Progress::default()),
        }
    }

    /// Attach an event channel
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach a cancel token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach a resume store; required for pause/resume durability
    pub fn with_resume(mut self, resume: ResumeManager) -> Self {
        self.resume = Some(resume);
        self
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Shared progress counter, pollable from other tasks
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Send one file to the connected peer
    pub async fn send_file(&mut self, name: &str, data: Bytes) -> Result<TransferStats> {
        self.send_file_at(name, None, data).await
    }

    /// Send one file carrying a relative path (folder transfers)
    pub async fn send_file_at(
        &mut self,
        name: &str,
        path: Option<String>,
        data: Bytes,
    ) -> Result<TransferStats> {
        let transfer_id = Uuid::new_v4();
        let started = Instant::now();
        let mut stats = TransferStats::new(transfer_id);

        if self.cancel.is_cancelled() {
            transition(&mut self.status, SessionStatus::Cancelled)?;
            return Err(Error::Cancelled);
        }

        transition(&mut self.status, SessionStatus::Negotiating)?;
        let (mut secret, mut keys) =
            match kex::run_initiator(&mut self.transport, transfer_id, &self.config.handshake)
                .await
            {
                Ok(pair) => pair,
                Err(err) => {
                    transition(&mut self.status, SessionStatus::Failed)?;
                    emit(
                        self.events.as_ref(),
                        SessionEvent::Failed {
                            transfer_id,
                            reason: err.to_string(),
                        },
                    )
                    .await;
                    return Err(err);
                }
            };

        let chunk_size = self.config.chunk_size.unwrap_or(self.controller.chunk_size());
        let chunker = FileChunker::new(data, chunk_size, self.config.handshake.suite.hash)?;
        let total = chunker.total_chunks();

        let name_bytes = if self.config.encrypt_name {
            let (nonce, sealed) = keys.send.encrypt(name.as_bytes(), b"filename")?;
            let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
            framed.extend_from_slice(&nonce);
            framed.extend_from_slice(&sealed);
            framed
        } else {
            name.as_bytes().to_vec()
        };

        let metadata = FileMetadata {
            transfer_id,
            name: name_bytes,
            name_encrypted: self.config.encrypt_name,
            size: chunker.file_size(),
            total_chunks: total,
            file_hash: chunker.file_hash(),
            path,
        };
        self.transport
            .send(Message::FileMetadata(metadata.clone()))
            .await?;

        transition(&mut self.status, SessionStatus::Transferring)?;
        self.progress.set_total(total);
        emit(
            self.events.as_ref(),
            SessionEvent::Started {
                transfer_id,
                total_chunks: total,
            },
        )
        .await;
        tracing::info!(
            transfer_id = %transfer_id,
            size = metadata.size,
            chunks = total,
            "sending file"
        );

        let mut bitmap = ChunkBitmap::new(total);
        let pending: Vec<u32> = (0..total).collect();
        let outcome = drive_send(
            &mut self.transport,
            &chunker,
            pending,
            &mut secret,
            &mut keys,
            &mut bitmap,
            transfer_id,
            &self.config,
            &mut self.controller,
            self.events.as_ref(),
            &self.cancel,
            &self.progress,
            &mut stats,
        )
        .await;
        let outcome = match outcome {
            Ok(()) => await_completion(&mut self.transport, self.config.idle_timeout).await,
            Err(err) => Err(err),
        };

        stats.elapsed = started.elapsed();
        self.conclude_send(outcome, &metadata, &bitmap, &secret, &keys, &chunker, stats)
            .await
    }

    /// Resume sending a previously interrupted transfer
    ///
    /// `data` must be the same file bytes as the original run; the peer is
    /// expected to open with a `ResumeRequest`.
    pub async fn resume_send(&mut self, transfer_id: Uuid, data: Bytes) -> Result<TransferStats> {
        let manager = self
            .resume
            .clone()
            .ok_or_else(|| Error::InvalidInput("resume requires a state store".into()))?;
        let loaded = match manager.load(transfer_id).await {
            Ok(Some(record)) if record.role == Role::Initiator => Ok(record),
            Ok(Some(_)) => Err(Error::InvalidInput(
                "persisted state belongs to the receive side".into(),
            )),
            Ok(None) => Err(Error::InvalidInput(format!(
                "no resumable state for {}",
                transfer_id
            ))),
            Err(err) => Err(err),
        };
        let record = match loaded {
            Ok(record) => record,
            Err(err) => {
                // Answer the peer's pending request so it learns the id is
                // gone instead of idling out
                self.decline_resume(transfer_id).await;
                transition(&mut self.status, SessionStatus::Failed)?;
                return Err(err);
            }
        };

        let started = Instant::now();
        let mut stats = TransferStats::new(transfer_id);
        let chunker = FileChunker::new(data, record.chunk_size, self.config.handshake.suite.hash)?;
        if !crypto::hashes_equal(&chunker.file_hash(), &record.metadata.file_hash) {
            self.decline_resume(transfer_id).await;
            transition(&mut self.status, SessionStatus::Failed)?;
            return Err(Error::FileHashMismatch);
        }

        transition(&mut self.status, SessionStatus::Negotiating)?;

        // Wait for the peer's resume request, then hand over what we can serve
        match recv_with_timeout(&mut self.transport, self.config.idle_timeout).await? {
            Some(Message::ResumeRequest { transfer_id: id }) if id == transfer_id => {}
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected resume-request, got {}",
                    other.kind()
                )))
            }
            None => return Err(Error::Transport("peer closed before resuming".into())),
        }
        // The full file bytes are in hand, so every chunk is servable; the
        // exported bitmap advertises what the peer may request
        let servable = ChunkBitmap::full(record.metadata.total_chunks);
        self.transport
            .send(Message::ResumeResponse {
                transfer_id,
                bitmap: servable.as_bytes().to_vec(),
                can_resume: true,
            })
            .await?;

        // Implicit rotation past the persisted generation; a paused counter
        // is never reused
        let generation = record.generation + 1;
        let mut secret = advance_secret(
            SharedSecret::from_bytes(record.resume_secret),
            record.generation,
            generation,
        )?;
        self.transport
            .send(Message::KeyRotation {
                session_id: transfer_id,
                generation,
            })
            .await?;
        let mut keys = kex::derive_session_keys_with(
            &secret,
            generation,
            Role::Initiator,
            self.config.handshake.suite,
        );
        stats.rotations += 1;

        let pending = match recv_with_timeout(&mut self.transport, self.config.idle_timeout).await? {
            Some(Message::ResumeChunkRequest {
                transfer_id: id,
                indices,
            }) if id == transfer_id => {
                if indices.iter().any(|&i| i >= record.metadata.total_chunks) {
                    return Err(Error::Protocol("resume request out of range".into()));
                }
                indices
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected resume-chunk-request, got {}",
                    other.kind()
                )))
            }
            None => return Err(Error::Transport("peer closed before resuming".into())),
        };

        transition(&mut self.status, SessionStatus::Transferring)?;
        let total = record.metadata.total_chunks;
        self.progress.set_total(total);
        let mut bitmap = record.bitmap.clone();
        self.progress.record(bitmap.count());
        tracing::info!(
            transfer_id = %transfer_id,
            remaining = pending.len(),
            generation,
            "resuming send"
        );

        let metadata = record.metadata.clone();
        let outcome = drive_send(
            &mut self.transport,
            &chunker,
            pending,
            &mut secret,
            &mut keys,
            &mut bitmap,
            transfer_id,
            &self.config,
            &mut self.controller,
            self.events.as_ref(),
            &self.cancel,
            &self.progress,
            &mut stats,
        )
        .await;
        let outcome = match outcome {
            Ok(()) => await_completion(&mut self.transport, self.config.idle_timeout).await,
            Err(err) => Err(err),
        };

        stats.elapsed = started.elapsed();
        self.conclude_send(outcome, &metadata, &bitmap, &secret, &keys, &chunker, stats)
            .await
    }

    /// Consume the peer's resume request and refuse it
    ///
    /// Best effort: if the peer never asks or the channel is gone, the local
    /// error stands on its own.
    async fn decline_resume(&mut self, transfer_id: Uuid) {
        let request = recv_with_timeout(&mut self.transport, self.config.idle_timeout).await;
        if let Ok(Some(Message::ResumeRequest { .. })) = request {
            let _ = self
                .transport
                .send(Message::ResumeResponse {
                    transfer_id,
                    bitmap: Vec::new(),
                    can_resume: false,
                })
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn conclude_send(
        &mut self,
        outcome: Result<()>,
        metadata: &FileMetadata,
        bitmap: &ChunkBitmap,
        secret: &SharedSecret,
        keys: &SessionKeys,
        chunker: &FileChunker,
        stats: TransferStats,
    ) -> Result<TransferStats> {
        let transfer_id = metadata.transfer_id;
        let events = self.events.as_ref();
        match outcome {
            Ok(()) => {
                transition(&mut self.status, SessionStatus::Completed)?;
                self.persist(metadata, bitmap, secret, keys, chunker.chunk_size(), Disposition::Completed)
                    .await;
                emit(events, SessionEvent::Completed { transfer_id }).await;
                metrics::counter!("pqdrop_transfers_completed_total", 1);
                tracing::info!(transfer_id = %transfer_id, "transfer complete");
                Ok(stats)
            }
            Err(Error::Cancelled) => {
                transition(&mut self.status, SessionStatus::Cancelled)?;
                if let Some(manager) = &self.resume {
                    let _ = manager.delete(transfer_id).await;
                }
                Err(Error::Cancelled)
            }
            Err(err @ Error::Transport(_)) => {
                transition(&mut self.status, SessionStatus::Paused)?;
                self.persist(metadata, bitmap, secret, keys, chunker.chunk_size(), Disposition::Paused)
                    .await;
                emit(events, SessionEvent::Paused { transfer_id }).await;
                tracing::warn!(transfer_id = %transfer_id, %err, "transfer paused");
                Err(err)
            }
            Err(err) => {
                transition(&mut self.status, SessionStatus::Failed)?;
                self.persist(metadata, bitmap, secret, keys, chunker.chunk_size(), Disposition::Failed)
                    .await;
                emit(
                    events,
                    SessionEvent::Failed {
                        transfer_id,
                        reason: err.to_string(),
                    },
                )
                .await;
                metrics::counter!("pqdrop_transfers_failed_total", 1);
                Err(err)
            }
        }
    }

    async fn persist(
        &self,
        metadata: &FileMetadata,
        bitmap: &ChunkBitmap,
        secret: &SharedSecret,
        keys: &SessionKeys,
        chunk_size: usize,
        disposition: Disposition,
    ) {
        let Some(manager) = &self.resume else { return };
        let record = ResumeRecord {
            transfer_id: metadata.transfer_id,
            metadata: metadata.clone(),
            bitmap: bitmap.clone(),
            disposition,
            updated_at: chrono::Utc::now(),
            resume_secret: *secret.as_bytes(),
            generation: keys.generation,
            role: Role::Initiator,
            chunk_size,
        };
        if let Err(err) = manager.save(&record).await {
            tracing::warn!(transfer_id = %metadata.transfer_id, %err, "failed to persist resume state");
        }
    }

    /// Receive one file from the connected peer
    pub async fn receive_file(&mut self) -> Result<ReceivedFile> {
        let started = Instant::now();

        if self.cancel.is_cancelled() {
            transition(&mut self.status, SessionStatus::Cancelled)?;
            return Err(Error::Cancelled);
        }

        transition(&mut self.status, SessionStatus::Negotiating)?;
        let (_session_id, mut secret, mut keys) =
            match kex::run_responder(&mut self.transport, &self.config.handshake).await {
                Ok(triple) => triple,
                Err(err) => {
                    transition(&mut self.status, SessionStatus::Failed)?;
                    return Err(err);
                }
            };

        let metadata = match recv_with_timeout(&mut self.transport, self.config.idle_timeout).await?
        {
            Some(Message::FileMetadata(metadata)) => metadata,
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected file-metadata, got {}",
                    other.kind()
                )))
            }
            None => return Err(Error::Transport("peer closed before metadata".into())),
        };
        if metadata.total_chunks > crate::MAX_CHUNK_COUNT {
            return Err(Error::Protocol(format!(
                "chunk count {} exceeds limit",
                metadata.total_chunks
            )));
        }

        // Unseal the name now, while generation-0 keys are live; rotation
        // replaces them before the transfer ends
        let name = if metadata.name_encrypted {
            unseal_name(&keys.recv, &metadata.name)?
        } else {
            metadata.name.clone()
        };
        // Persisted records carry the plaintext name so resume never needs
        // the original generation's key
        let record_metadata = FileMetadata {
            name: name.clone(),
            name_encrypted: false,
            ..metadata.clone()
        };

        let mut stats = TransferStats::new(metadata.transfer_id);
        let mut reassembler = Reassembler::new(metadata.total_chunks)?;
        let mut bitmap = ChunkBitmap::new(metadata.total_chunks);

        transition(&mut self.status, SessionStatus::Transferring)?;
        self.progress.set_total(metadata.total_chunks);
        emit(
            self.events.as_ref(),
            SessionEvent::Started {
                transfer_id: metadata.transfer_id,
                total_chunks: metadata.total_chunks,
            },
        )
        .await;

        let outcome = drive_receive(
            &mut self.transport,
            &record_metadata,
            &mut secret,
            &mut keys,
            &mut reassembler,
            &mut bitmap,
            &self.config,
            self.events.as_ref(),
            &self.cancel,
            self.resume.as_ref(),
            &self.progress,
            &mut stats,
        )
        .await;

        stats.elapsed = started.elapsed();
        self.conclude_receive(outcome, metadata, name, reassembler, bitmap, secret, keys, stats)
            .await
    }

    /// Resume receiving a previously interrupted transfer
    pub async fn resume_receive(&mut self, transfer_id: Uuid) -> Result<ReceivedFile> {
        let manager = self
            .resume
            .clone()
            .ok_or_else(|| Error::InvalidInput("resume requires a state store".into()))?;
        let record = manager
            .load(transfer_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("no resumable state for {}", transfer_id)))?;
        if record.role != Role::Responder {
            return Err(Error::InvalidInput(
                "persisted state belongs to the send side".into(),
            ));
        }

        let started = Instant::now();
        let metadata = record.metadata.clone();
        let mut stats = TransferStats::new(transfer_id);
        let mut reassembler = Reassembler::new(metadata.total_chunks)?;
        let mut bitmap = ChunkBitmap::new(metadata.total_chunks);

        // The persisted payloads are the durable truth; rebuild the bitmap
        // from what actually survived
        for index in 0..metadata.total_chunks {
            if !record.bitmap.contains(index) {
                continue;
            }
            if let Some(data) = manager.load_chunk(transfer_id, index).await? {
                reassembler.insert(index, Bytes::from(data))?;
                bitmap.set(index)?;
            }
        }

        transition(&mut self.status, SessionStatus::Negotiating)?;
        self.transport
            .send(Message::ResumeRequest { transfer_id })
            .await?;

        let peer_has = match recv_with_timeout(&mut self.transport, self.config.idle_timeout)
            .await?
        {
            Some(Message::ResumeResponse {
                transfer_id: id,
                bitmap,
                can_resume,
            }) if id == transfer_id => {
                if !can_resume {
                    return Err(Error::TransferExpired(transfer_id.to_string()));
                }
                ChunkBitmap::from_bytes(metadata.total_chunks, bitmap)?
            }
            Some(Message::Error { reason }) => return Err(Error::Protocol(reason)),
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected resume-response, got {}",
                    other.kind()
                )))
            }
            None => return Err(Error::Transport("peer closed before resuming".into())),
        };

        // The peer announces which generation the resumed run uses; walk our
        // chain forward to meet it
        let generation = match recv_with_timeout(&mut self.transport, self.config.idle_timeout)
            .await?
        {
            Some(Message::KeyRotation { generation, .. }) => generation,
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected key-rotation, got {}",
                    other.kind()
                )))
            }
            None => return Err(Error::Transport("peer closed before resuming".into())),
        };
        let mut secret = advance_secret(
            SharedSecret::from_bytes(record.resume_secret),
            record.generation,
            generation,
        )?;
        let mut keys = kex::derive_session_keys_with(
            &secret,
            generation,
            Role::Responder,
            self.config.handshake.suite,
        );
        stats.rotations += 1;

        // Request the peer-servable subset of what is locally missing
        let indices: Vec<u32> = bitmap
            .missing()
            .into_iter()
            .filter(|&index| peer_has.contains(index))
            .collect();
        self.transport
            .send(Message::ResumeChunkRequest {
                transfer_id,
                indices,
            })
            .await?;

        transition(&mut self.status, SessionStatus::Transferring)?;
        self.progress.set_total(metadata.total_chunks);
        self.progress.record(bitmap.count());
        tracing::info!(
            transfer_id = %transfer_id,
            missing = bitmap.missing().len(),
            generation,
            "resuming receive"
        );

        let outcome = drive_receive(
            &mut self.transport,
            &metadata,
            &mut secret,
            &mut keys,
            &mut reassembler,
            &mut bitmap,
            &self.config,
            self.events.as_ref(),
            &self.cancel,
            Some(&manager),
            &self.progress,
            &mut stats,
        )
        .await;

        stats.elapsed = started.elapsed();
        let name = metadata.name.clone();
        self.conclude_receive(outcome, metadata, name, reassembler, bitmap, secret, keys, stats)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn conclude_receive(
        &mut self,
        outcome: Result<()>,
        metadata: FileMetadata,
        name: Vec<u8>,
        reassembler: Reassembler,
        bitmap: ChunkBitmap,
        secret: SharedSecret,
        keys: SessionKeys,
        stats: TransferStats,
    ) -> Result<ReceivedFile> {
        let transfer_id = metadata.transfer_id;
        let suite = self.config.handshake.suite;
        let chunk_size = metadata
            .size
            .div_ceil(metadata.total_chunks.max(1) as u64)
            .max(1) as usize;

        // Records carry the plaintext name; resume must not depend on a
        // retired key generation
        let record_metadata = FileMetadata {
            name: name.clone(),
            name_encrypted: false,
            ..metadata.clone()
        };
        let persist_as = |disposition| ResumeRecord {
            transfer_id,
            metadata: record_metadata.clone(),
            bitmap: bitmap.clone(),
            disposition,
            updated_at: chrono::Utc::now(),
            resume_secret: *secret.as_bytes(),
            generation: keys.generation,
            role: Role::Responder,
            chunk_size,
        };

        match outcome {
            Ok(()) => {
                let verified = reassembler.assemble_verified(suite.hash, &metadata.file_hash);
                match verified {
                    Ok(data) => {
                        self.transport
                            .send(Message::Complete { success: true })
                            .await?;
                        transition(&mut self.status, SessionStatus::Completed)?;
                        if let Some(manager) = &self.resume {
                            let _ = manager.save(&persist_as(Disposition::Completed)).await;
                        }
                        emit(self.events.as_ref(), SessionEvent::Completed { transfer_id }).await;
                        metrics::counter!("pqdrop_transfers_completed_total", 1);
                        tracing::info!(transfer_id = %transfer_id, size = data.len(), "file received");
                        Ok(ReceivedFile {
                            metadata,
                            name,
                            data,
                            stats,
                        })
                    }
                    Err(err) => {
                        let _ = self
                            .transport
                            .send(Message::Complete { success: false })
                            .await;
                        transition(&mut self.status, SessionStatus::Failed)?;
                        if let Some(manager) = &self.resume {
                            let _ = manager.save(&persist_as(Disposition::Failed)).await;
                        }
                        emit(
                            self.events.as_ref(),
                            SessionEvent::Failed {
                                transfer_id,
                                reason: err.to_string(),
                            },
                        )
                        .await;
                        Err(err)
                    }
                }
            }
            Err(Error::Cancelled) => {
                transition(&mut self.status, SessionStatus::Cancelled)?;
                if let Some(manager) = &self.resume {
                    let _ = manager.delete(transfer_id).await;
                }
                Err(Error::Cancelled)
            }
            Err(err @ Error::Transport(_)) => {
                transition(&mut self.status, SessionStatus::Paused)?;
                if let Some(manager) = &self.resume {
                    let _ = manager.save(&persist_as(Disposition::Paused)).await;
                }
                emit(self.events.as_ref(), SessionEvent::Paused { transfer_id }).await;
                tracing::warn!(transfer_id = %transfer_id, %err, "transfer paused");
                Err(err)
            }
            Err(err) => {
                let _ = self
                    .transport
                    .send(Message::Error {
                        reason: err.to_string(),
                    })
                    .await;
                transition(&mut self.status, SessionStatus::Failed)?;
                if let Some(manager) = &self.resume {
                    let _ = manager.save(&persist_as(Disposition::Failed)).await;
                }
                emit(
                    self.events.as_ref(),
                    SessionEvent::Failed {
                        transfer_id,
                        reason: err.to_string(),
                    },
                )
                .await;
                metrics::counter!("pqdrop_transfers_failed_total", 1);
                Err(err)
            }
        }
    }
}

fn unseal_name(recv: &RecvCipher, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Protocol("sealed file name too short".into()));
    }
    let nonce: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| Error::Protocol("sealed file name too short".into()))?;
    recv.decrypt(&nonce, &sealed[NONCE_LEN..], b"filename")
}

async fn recv_with_timeout<T: Transport>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Option<Message>> {
    match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transport("peer idle past timeout".into())),
    }
}

async fn await_completion<T: Transport>(transport: &mut T, timeout: Duration) -> Result<()> {
    match recv_with_timeout(transport, timeout).await? {
        Some(Message::Complete { success: true }) => Ok(()),
        Some(Message::Complete { success: false }) => Err(Error::FileHashMismatch),
        Some(Message::Error { reason }) => Err(Error::Protocol(reason)),
        Some(other) => Err(Error::Protocol(format!(
            "expected complete, got {}",
            other.kind()
        ))),
        None => Err(Error::Transport("peer closed before completing".into())),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_send<T: Transport>(
    transport: &mut T,
    chunker: &FileChunker,
    pending: Vec<u32>,
    secret: &mut SharedSecret,
    keys: &mut SessionKeys,
    bitmap: &mut ChunkBitmap,
    transfer_id: Uuid,
    config: &SessionConfig,
    controller: &mut BitrateController,
    events: Option<&mpsc::Sender<SessionEvent>>,
    cancel: &CancelToken,
    progress: &Progress,
    stats: &mut TransferStats,
) -> Result<()> {
    let mut queue: VecDeque<u32> = pending.into();
    let mut inflight: HashMap<u32, Flight> = HashMap::new();
    let mut cancel = cancel.clone();
    let mut pacer = Pacer::new();
    let mut rotation_clock = Instant::now();
    let mut bytes_this_generation: u64 = 0;
    let mut last_rtt: Option<Duration> = None;
    let mut recent_acks: u32 = 0;
    let mut recent_retries: u32 = 0;
    let total = chunker.total_chunks();

    loop {
        // Fill the send window
        while inflight.len() < controller.concurrency() as usize {
            let Some(index) = queue.pop_front() else { break };

            if rotation_clock.elapsed() >= config.rotation_interval
                || bytes_this_generation >= config.rotation_bytes
            {
                let generation = keys.generation + 1;
                *secret = kex::rotate_secret(secret, generation);
                transport
                    .send(Message::KeyRotation {
                        session_id: transfer_id,
                        generation,
                    })
                    .await?;
                *keys = kex::derive_session_keys_with(
                    secret,
                    generation,
                    Role::Initiator,
                    config.handshake.suite,
                );
                stats.rotations += 1;
                rotation_clock = Instant::now();
                bytes_this_generation = 0;
                emit(
                    events,
                    SessionEvent::KeyRotated {
                        transfer_id,
                        generation,
                    },
                )
                .await;
                metrics::counter!("pqdrop_key_rotations_total", 1);
                tracing::debug!(transfer_id = %transfer_id, generation, "rotated session keys");
            }

            let piece = chunker
                .piece(index)
                .ok_or_else(|| Error::InvalidInput(format!("chunk index {} out of range", index)))?;
            let sent = send_chunk(transport, keys, transfer_id, &piece).await?;
            bytes_this_generation += sent;
            let rate = config
                .bandwidth_limit
                .map_or(controller.target_rate(), |cap| cap.min(controller.target_rate()));
            pacer.pace(sent, rate).await;
            inflight.insert(
                index,
                Flight {
                    attempts: 1,
                    deadline: TokioInstant::now() + config.ack_timeout,
                    sent_at: Instant::now(),
                },
            );
        }
        if inflight.is_empty() && queue.is_empty() {
            return Ok(());
        }

        let next_deadline = inflight
            .values()
            .map(|f| f.deadline)
            .min()
            .unwrap_or_else(|| TokioInstant::now() + config.ack_timeout);

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = transport.send(Message::Error { reason: "transfer cancelled".into() }).await;
                return Err(Error::Cancelled);
            }
            outcome = tokio::time::timeout_at(next_deadline, transport.recv()) => match outcome {
                Err(_) => {
                    // Ack deadline hit; resend under a fresh nonce
                    let now = TokioInstant::now();
                    let expired: Vec<u32> = inflight
                        .iter()
                        .filter(|(_, flight)| flight.deadline <= now)
                        .map(|(&index, _)| index)
                        .collect();
                    for index in expired {
                        let Some(flight) = inflight.get_mut(&index) else { continue };
                        if flight.attempts >= config.max_chunk_attempts {
                            return Err(Error::ChunkTimeout {
                                index,
                                attempts: flight.attempts,
                            });
                        }
                        let piece = chunker.piece(index).ok_or_else(|| {
                            Error::InvalidInput(format!("chunk index {} out of range", index))
                        })?;
                        let sent = send_chunk(transport, keys, transfer_id, &piece).await?;
                        bytes_this_generation += sent;
                        flight.attempts += 1;
                        flight.deadline = TokioInstant::now() + config.ack_timeout;
                        flight.sent_at = Instant::now();
                        stats.retries += 1;
                        recent_retries += 1;
                        controller.observe(NetworkSample {
                            rtt: last_rtt.unwrap_or(config.ack_timeout),
                            loss: 1.0,
                            jitter: Duration::ZERO,
                            buffer: inflight_occupancy(inflight.len(), controller.concurrency()),
                        });
                        tracing::debug!(transfer_id = %transfer_id, index, "chunk ack timed out, resending");
                    }
                }
                Ok(Ok(Some(Message::Ack { index }))) => {
                    let Some(flight) = inflight.remove(&index) else { continue };
                    bitmap.set(index)?;
                    let piece_len = chunker
                        .piece(index)
                        .map(|p| p.data.len() as u64)
                        .unwrap_or(0);
                    stats.chunks += 1;
                    stats.bytes += piece_len;
                    recent_acks += 1;
                    progress.record(bitmap.count());

                    let rtt = flight.sent_at.elapsed();
                    let jitter = last_rtt
                        .map(|previous| {
                            if rtt > previous { rtt - previous } else { previous - rtt }
                        })
                        .unwrap_or(Duration::ZERO);
                    last_rtt = Some(rtt);
                    let loss = if recent_acks + recent_retries > 0 {
                        recent_retries as f64 / (recent_acks + recent_retries) as f64
                    } else {
                        0.0
                    };
                    controller.observe(NetworkSample {
                        rtt,
                        loss,
                        jitter,
                        buffer: inflight_occupancy(inflight.len(), controller.concurrency()),
                    });
                    if recent_acks + recent_retries >= 32 {
                        recent_acks = 0;
                        recent_retries = 0;
                    }

                    emit(events, SessionEvent::ChunkTransferred {
                        transfer_id,
                        index,
                        completed: bitmap.count(),
                        total,
                    }).await;
                }
                Ok(Ok(Some(Message::Error { reason }))) => {
                    let Some(index) = parse_chunk_error(&reason) else {
                        return Err(Error::Protocol(format!("peer error: {}", reason)));
                    };
                    // Peer rejected the chunk as corrupt; bounded resend
                    // under a fresh nonce
                    let Some(flight) = inflight.get_mut(&index) else { continue };
                    if flight.attempts >= config.max_chunk_attempts {
                        return Err(Error::ChunkHashMismatch { index });
                    }
                    let piece = chunker.piece(index).ok_or_else(|| {
                        Error::InvalidInput(format!("chunk index {} out of range", index))
                    })?;
                    let sent = send_chunk(transport, keys, transfer_id, &piece).await?;
                    bytes_this_generation += sent;
                    flight.attempts += 1;
                    flight.deadline = TokioInstant::now() + config.ack_timeout;
                    flight.sent_at = Instant::now();
                    stats.retries += 1;
                    recent_retries += 1;
                    tracing::warn!(transfer_id = %transfer_id, index, "peer reported hash mismatch, resending");
                }
                Ok(Ok(Some(other))) => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} while transferring",
                        other.kind()
                    )));
                }
                Ok(Ok(None)) => {
                    return Err(Error::Transport("peer connection lost".into()));
                }
                Ok(Err(err)) => {
                    return Err(Error::Transport(err.to_string()));
                }
            }
        }
    }
}

fn inflight_occupancy(inflight: usize, concurrency: u32) -> f64 {
    if concurrency == 0 {
        0.0
    } else {
        inflight as f64 / concurrency as f64
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_receive<T: Transport>(
    transport: &mut T,
    metadata: &FileMetadata,
    secret: &mut SharedSecret,
    keys: &mut SessionKeys,
    reassembler: &mut Reassembler,
    bitmap: &mut ChunkBitmap,
    config: &SessionConfig,
    events: Option<&mpsc::Sender<SessionEvent>>,
    cancel: &CancelToken,
    resume: Option<&ResumeManager>,
    progress: &Progress,
    stats: &mut TransferStats,
) -> Result<()> {
    let transfer_id = metadata.transfer_id;
    let max_ciphertext = config.adaptive.profile.max_ciphertext();
    let nominal_chunk = metadata
        .size
        .div_ceil(metadata.total_chunks.max(1) as u64)
        .max(1) as usize;
    let mut cancel = cancel.clone();
    // Previous-generation cipher kept briefly so in-flight chunks survive a
    // rotation
    let mut grace: Option<(RecvCipher, TokioInstant)> = None;
    let mut rejects: HashMap<u32, u32> = HashMap::new();

    loop {
        if bitmap.is_complete() {
            return Ok(());
        }

        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = transport.send(Message::Error { reason: "transfer cancelled".into() }).await;
                return Err(Error::Cancelled);
            }
            message = recv_with_timeout(transport, config.idle_timeout) => message?,
        };

        match message {
            Some(Message::Chunk(chunk)) => {
                chunk.validate(metadata.total_chunks, max_ciphertext)?;
                let index = chunk.index;
                if bitmap.contains(index) {
                    // Repeat delivery; the earlier ack was likely lost
                    transport.send(Message::Ack { index }).await?;
                    continue;
                }

                let aad = chunk_aad(transfer_id, index);
                let decrypted = match keys.recv.decrypt(&chunk.nonce, &chunk.ciphertext, &aad) {
                    Ok(plaintext) => Some(plaintext),
                    Err(_) => match &grace {
                        Some((previous, expiry)) if TokioInstant::now() < *expiry => {
                            previous.decrypt(&chunk.nonce, &chunk.ciphertext, &aad).ok()
                        }
                        _ => None,
                    },
                };

                // Failed authentication and a bad plaintext hash are both
                // chunk corruption; the sender re-encrypts on resend
                let verified = decrypted.filter(|plaintext| {
                    let digest = crypto::hash_bytes(config.handshake.suite.hash, plaintext);
                    crypto::hashes_equal(&digest, &chunk.plaintext_hash)
                });
                let plaintext = match verified {
                    Some(plaintext) => plaintext,
                    None => {
                        let count = rejects.entry(index).or_insert(0);
                        *count += 1;
                        if *count >= config.max_chunk_attempts {
                            return Err(Error::ChunkHashMismatch { index });
                        }
                        transport
                            .send(Message::Error {
                                reason: chunk_error_reason(index),
                            })
                            .await?;
                        tracing::warn!(
                            transfer_id = %transfer_id,
                            index,
                            "corrupt chunk rejected, awaiting resend"
                        );
                        continue;
                    }
                };

                // Durability before acknowledgment: a crash after this point
                // never loses an acked chunk
                if let Some(manager) = resume {
                    manager.save_chunk(transfer_id, index, &plaintext).await?;
                }
                let size = plaintext.len() as u64;
                reassembler.insert(index, Bytes::from(plaintext))?;
                bitmap.set(index)?;
                if let Some(manager) = resume {
                    let record = ResumeRecord {
                        transfer_id,
                        metadata: metadata.clone(),
                        bitmap: bitmap.clone(),
                        disposition: Disposition::Paused,
                        updated_at: chrono::Utc::now(),
                        resume_secret: *secret.as_bytes(),
                        generation: keys.generation,
                        role: Role::Responder,
                        chunk_size: nominal_chunk,
                    };
                    manager.save(&record).await?;
                }
                transport.send(Message::Ack { index }).await?;

                stats.chunks += 1;
                stats.bytes += size;
                progress.record(bitmap.count());
                emit(
                    events,
                    SessionEvent::ChunkTransferred {
                        transfer_id,
                        index,
                        completed: bitmap.count(),
                        total: metadata.total_chunks,
                    },
                )
                .await;
            }
            Some(Message::KeyRotation { generation, .. }) => {
                if generation <= keys.generation {
                    return Err(Error::Protocol(format!(
                        "key generation regressed: {} -> {}",
                        keys.generation, generation
                    )));
                }
                let advanced = advance_secret(
                    SharedSecret::from_bytes(*secret.as_bytes()),
                    keys.generation,
                    generation,
                )?;
                *secret = advanced;
                let fresh = kex::derive_session_keys_with(
                    secret,
                    generation,
                    Role::Responder,
                    config.handshake.suite,
                );
                let previous = std::mem::replace(keys, fresh);
                grace = Some((
                    previous.recv,
                    TokioInstant::now() + config.rotation_grace,
                ));
                stats.rotations += 1;
                emit(
                    events,
                    SessionEvent::KeyRotated {
                        transfer_id,
                        generation,
                    },
                )
                .await;
                tracing::debug!(transfer_id = %transfer_id, generation, "peer rotated session keys");
            }
            Some(Message::Error { reason }) => {
                return Err(Error::Protocol(format!("peer error: {}", reason)));
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "unexpected {} while transferring",
                    other.kind()
                )));
            }
            None => {
                return Err(Error::Transport("peer connection lost".into()));
            }
        }
    }
}
