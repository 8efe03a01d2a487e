//! Resumable transfer state
//!
//! Received-chunk bitmaps and handshake material are persisted through a
//! pluggable key-value store so an interrupted transfer can restart without
//! re-sending chunks that already arrived. A chunk is only acknowledged after
//! its payload and bitmap update are durable.

use crate::error::{Error, Result};
use crate::kex::Role;
use crate::protocol::FileMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroize;

/// How long a record is retained after a transfer pauses
pub const RETAIN_PAUSED_HOURS: i64 = 7 * 24;
/// How long a record is retained after a transfer completes
pub const RETAIN_COMPLETED_HOURS: i64 = 24;
/// How long a record is retained after a transfer fails
pub const RETAIN_FAILED_HOURS: i64 = 1;

/// Dense bit-per-chunk receipt index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    total: u32,
    bits: Vec<u8>,
}

impl ChunkBitmap {
    /// Create an all-clear bitmap for `total` chunks
    pub fn new(total: u32) -> Self {
        let bytes = (total as usize).div_ceil(8);
        Self {
            total,
            bits: vec![0u8; bytes],
        }
    }

    /// Create a bitmap with every chunk marked
    pub fn full(total: u32) -> Self {
        let mut bitmap = Self::new(total);
        for byte in &mut bitmap.bits {
            *byte = 0xFF;
        }
        // Clear the padding bits past `total`
        let tail = (total % 8) as usize;
        if tail != 0 {
            if let Some(last) = bitmap.bits.last_mut() {
                *last = (1u8 << tail) - 1;
            }
        }
        bitmap
    }

    /// Rebuild from a wire payload; the byte length must match `total`
    pub fn from_bytes(total: u32, bits: Vec<u8>) -> Result<Self> {
        let expected = (total as usize).div_ceil(8);
        if bits.len() != expected {
            return Err(Error::InvalidInput(format!(
                "bitmap length {} does not match {} chunks",
                bits.len(),
                total
            )));
        }
        Ok(Self { total, bits })
    }

    /// Mark chunk `index` as received
    pub fn set(&mut self, index: u32) -> Result<()> {
        if index >= self.total {
            return Err(Error::InvalidInput(format!(
                "chunk index {} out of range ({} total)",
                index, self.total
            )));
        }
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
        Ok(())
    }

    /// Whether chunk `index` has been received
    pub fn contains(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Total chunk count this bitmap covers
    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    /// Number of chunks marked received
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Whether every chunk is marked
    pub fn is_complete(&self) -> bool {
        self.count() == self.total
    }

    /// Indices not yet marked, ascending
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total).filter(|&i| !self.contains(i)).collect()
    }

    /// Raw bitmap bytes for the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Terminal disposition of a persisted transfer, driving retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Interrupted mid-flight, resumable
    Paused,
    /// Finished and verified
    Completed,
    /// Failed permanently
    Failed,
}

impl Disposition {
    fn retention(self) -> ChronoDuration {
        match self {
            Disposition::Paused => ChronoDuration::hours(RETAIN_PAUSED_HOURS),
            Disposition::Completed => ChronoDuration::hours(RETAIN_COMPLETED_HOURS),
            Disposition::Failed => ChronoDuration::hours(RETAIN_FAILED_HOURS),
        }
    }
}

/// Everything needed to resume one side of a transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub transfer_id: Uuid,
    pub metadata: FileMetadata,
    pub bitmap: ChunkBitmap,
    pub disposition: Disposition,
    pub updated_at: DateTime<Utc>,
    /// Current rung of the rotation chain; resume rotates past it
    pub resume_secret: [u8; 32],
    /// Key generation the secret belongs to
    pub generation: u32,
    /// Handshake role this side held
    pub role: Role,
    /// Chunk size negotiated for the original transfer
    pub chunk_size: usize,
}

impl ResumeRecord {
    /// Whether the record has outlived its retention window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.updated_at > self.disposition.retention()
    }
}

impl Drop for ResumeRecord {
    fn drop(&mut self) {
        self.resume_secret.zeroize();
    }
}

/// Key-value persistence backend
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

fn record_key(transfer_id: Uuid) -> String {
    format!("resume/{}", transfer_id)
}

fn chunk_key(transfer_id: Uuid, index: u32) -> String {
    format!("chunk/{}/{}", transfer_id, index)
}

/// Durable transfer-state manager over a [`KvStore`]
#[derive(Clone)]
pub struct ResumeManager {
    store: Arc<dyn KvStore>,
}

impl ResumeManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Persist the record, refreshing its retention clock
    pub async fn save(&self, record: &ResumeRecord) -> Result<()> {
        let encoded = postcard::to_allocvec(record)?;
        self.store.put(&record_key(record.transfer_id), encoded).await?;
        metrics::counter!("pqdrop_resume_saves_total", 1);
        Ok(())
    }

    /// Load a record
    ///
    /// Unknown transfers return `Ok(None)`; an expired record is deleted and
    /// reported as [`Error::TransferExpired`].
    pub async fn load(&self, transfer_id: Uuid) -> Result<Option<ResumeRecord>> {
        let Some(raw) = self.store.get(&record_key(transfer_id)).await? else {
            return Ok(None);
        };
        let record: ResumeRecord = postcard::from_bytes(&raw)?;
        if record.is_expired(Utc::now()) {
            self.delete(transfer_id).await?;
            return Err(Error::TransferExpired(transfer_id.to_string()));
        }
        Ok(Some(record))
    }

    /// Persist one decrypted chunk payload before it is acknowledged
    pub async fn save_chunk(&self, transfer_id: Uuid, index: u32, data: &[u8]) -> Result<()> {
        self.store
            .put(&chunk_key(transfer_id, index), data.to_vec())
            .await
    }

    /// Load one persisted chunk payload
    pub async fn load_chunk(&self, transfer_id: Uuid, index: u32) -> Result<Option<Vec<u8>>> {
        self.store.get(&chunk_key(transfer_id, index)).await
    }

    /// Remove the record and all persisted chunks for a transfer
    pub async fn delete(&self, transfer_id: Uuid) -> Result<()> {
        self.store.delete(&record_key(transfer_id)).await?;
        let prefix = format!("chunk/{}/", transfer_id);
        for key in self.store.list_prefix(&prefix).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    /// All paused, unexpired transfers
    pub async fn list_resumable(&self) -> Result<Vec<ResumeRecord>> {
        let now = Utc::now();
        let mut records = Vec::new();
        for key in self.store.list_prefix("resume/").await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let record: ResumeRecord = postcard::from_bytes(&raw)?;
            if record.disposition == Disposition::Paused && !record.is_expired(now) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete every record past its retention window; returns how many
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for key in self.store.list_prefix("resume/").await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let record: ResumeRecord = postcard::from_bytes(&raw)?;
            if record.is_expired(now) {
                self.delete(record.transfer_id).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "purged expired transfer records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashAlgorithm;

    fn test_metadata(transfer_id: Uuid, total_chunks: u32) -> FileMetadata {
        FileMetadata {
            transfer_id,
            name: b"report.pdf".to_vec(),
            name_encrypted: false,
            size: total_chunks as u64 * 64 * 1024,
            total_chunks,
            file_hash: crate::crypto::hash_bytes(HashAlgorithm::Blake3, b"test"),
            path: None,
        }
    }

    fn test_record(disposition: Disposition, updated_at: DateTime<Utc>) -> ResumeRecord {
        let transfer_id = Uuid::new_v4();
        ResumeRecord {
            transfer_id,
            metadata: test_metadata(transfer_id, 10),
            bitmap: ChunkBitmap::new(10),
            disposition,
            updated_at,
            resume_secret: [7u8; 32],
            generation: 2,
            role: Role::Responder,
            chunk_size: 64 * 1024,
        }
    }

    #[test]
    fn test_bitmap_set_and_missing() {
        let mut bitmap = ChunkBitmap::new(10);
        for i in [0u32, 1, 2, 5, 7] {
            bitmap.set(i).unwrap();
        }
        assert_eq!(bitmap.count(), 5);
        assert_eq!(bitmap.missing(), vec![3, 4, 6, 8, 9]);
        assert!(!bitmap.is_complete());
        for i in bitmap.missing() {
            bitmap.set(i).unwrap();
        }
        assert!(bitmap.is_complete());
        assert!(bitmap.missing().is_empty());
    }

    #[test]
    fn test_bitmap_full() {
        let full = ChunkBitmap::full(13);
        assert!(full.is_complete());
        assert_eq!(full.count(), 13);
        assert!(full.missing().is_empty());
        assert!(!full.contains(13));
        assert_eq!(ChunkBitmap::full(16).count(), 16);
        assert!(ChunkBitmap::full(0).is_complete());
    }

    #[test]
    fn test_bitmap_out_of_range() {
        let mut bitmap = ChunkBitmap::new(8);
        assert!(bitmap.set(8).is_err());
        assert!(!bitmap.contains(8));
    }

    #[test]
    fn test_bitmap_wire_roundtrip() {
        let mut bitmap = ChunkBitmap::new(13);
        bitmap.set(0).unwrap();
        bitmap.set(12).unwrap();
        let rebuilt = ChunkBitmap::from_bytes(13, bitmap.as_bytes().to_vec()).unwrap();
        assert_eq!(rebuilt, bitmap);
        assert!(ChunkBitmap::from_bytes(13, vec![0u8; 1]).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        let record = test_record(Disposition::Paused, Utc::now());
        manager.save(&record).await.unwrap();

        let loaded = manager.load(record.transfer_id).await.unwrap().unwrap();
        assert_eq!(loaded.transfer_id, record.transfer_id);
        assert_eq!(loaded.generation, 2);
        assert_eq!(loaded.resume_secret, [7u8; 32]);
    }

    #[tokio::test]
    async fn test_load_unknown_is_none() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        assert!(manager.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_record_rejected_and_removed() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        let record = test_record(Disposition::Failed, Utc::now() - ChronoDuration::hours(2));
        manager.save(&record).await.unwrap();

        match manager.load(record.transfer_id).await {
            Err(Error::TransferExpired(_)) => {}
            other => panic!("expected TransferExpired, got {:?}", other.map(|_| ())),
        }
        // Second load sees nothing at all
        assert!(manager.load(record.transfer_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_windows() {
        let now = Utc::now();
        let fresh_paused = test_record(Disposition::Paused, now - ChronoDuration::days(6));
        assert!(!fresh_paused.is_expired(now));
        let stale_paused = test_record(Disposition::Paused, now - ChronoDuration::days(8));
        assert!(stale_paused.is_expired(now));
        let stale_completed = test_record(Disposition::Completed, now - ChronoDuration::hours(25));
        assert!(stale_completed.is_expired(now));
        let fresh_failed = test_record(Disposition::Failed, now - ChronoDuration::minutes(30));
        assert!(!fresh_failed.is_expired(now));
    }

    #[tokio::test]
    async fn test_chunk_payload_roundtrip() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        let id = Uuid::new_v4();
        manager.save_chunk(id, 3, b"payload").await.unwrap();
        assert_eq!(
            manager.load_chunk(id, 3).await.unwrap().as_deref(),
            Some(&b"payload"[..])
        );
        manager.delete(id).await.unwrap();
        assert!(manager.load_chunk(id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_resumable_filters_dispositions() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        let paused = test_record(Disposition::Paused, Utc::now());
        let completed = test_record(Disposition::Completed, Utc::now());
        manager.save(&paused).await.unwrap();
        manager.save(&completed).await.unwrap();

        let resumable = manager.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].transfer_id, paused.transfer_id);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let manager = ResumeManager::new(Arc::new(MemoryKvStore::new()));
        let live = test_record(Disposition::Paused, Utc::now());
        let dead = test_record(Disposition::Failed, Utc::now() - ChronoDuration::hours(3));
        manager.save(&live).await.unwrap();
        manager.save(&dead).await.unwrap();

        assert_eq!(manager.purge_expired().await.unwrap(), 1);
        assert!(manager.load(live.transfer_id).await.unwrap().is_some());
        assert!(manager.load(dead.transfer_id).await.unwrap().is_none());
    }
}
