//! File chunking and reassembly
//!
//! Splits a file into fixed-size pieces with per-piece plaintext hashes and
//! rebuilds it on the receive side. Chunks arrive in any order; index order
//! is restored at assembly time, not at receipt time.

use crate::crypto::{self, HashAlgorithm, HASH_LEN};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};

/// One plaintext piece of a file
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    /// 0-based chunk index
    pub index: u32,
    /// Plaintext bytes
    pub data: Bytes,
    /// Content hash of the plaintext
    pub hash: [u8; HASH_LEN],
}

/// Splits a file into caller-sized pieces
#[derive(Debug, Clone)]
pub struct FileChunker {
    data: Bytes,
    chunk_size: usize,
    total_chunks: u32,
    hash: HashAlgorithm,
}

impl FileChunker {
    /// Create a chunker over the file bytes
    ///
    /// The chunk size is clamped to the engine bounds; the resulting chunk
    /// count must stay under `MAX_CHUNK_COUNT` to bound receiver memory.
    pub fn new(data: Bytes, chunk_size: usize, hash: HashAlgorithm) -> Result<Self> {
        let chunk_size = chunk_size.clamp(crate::MIN_CHUNK_SIZE, crate::MAX_CHUNK_SIZE);
        let total = data.len().div_ceil(chunk_size);
        if total > crate::MAX_CHUNK_COUNT as usize {
            return Err(Error::InvalidInput(format!(
                "file needs {} chunks, limit is {}",
                total,
                crate::MAX_CHUNK_COUNT
            )));
        }
        Ok(Self {
            data,
            chunk_size,
            total_chunks: total as u32,
            hash,
        })
    }

    /// Total number of chunks, `ceil(size / chunk_size)`
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Chunk size in bytes (after clamping)
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// File size in bytes
    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whole-file content hash
    pub fn file_hash(&self) -> [u8; HASH_LEN] {
        crypto::hash_bytes(self.hash, &self.data)
    }

    /// One piece by index; `None` past the end
    pub fn piece(&self, index: u32) -> Option<ChunkPiece> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as usize * self.chunk_size;
        let end = (offset + self.chunk_size).min(self.data.len());
        let data = self.data.slice(offset..end);
        let hash = crypto::hash_bytes(self.hash, &data);
        Some(ChunkPiece { index, data, hash })
    }

    /// Iterate over all pieces in index order
    pub fn pieces(&self) -> impl Iterator<Item = ChunkPiece> + '_ {
        (0..self.total_chunks).filter_map(|i| self.piece(i))
    }
}

/// Rebuilds a file from out-of-order pieces
///
/// A slot arena indexed by chunk number; single-writer per session, no
/// cross-session sharing.
#[derive(Debug)]
pub struct Reassembler {
    slots: Vec<Option<Bytes>>,
    received: u32,
}

impl Reassembler {
    /// Create a reassembler expecting `total_chunks` pieces
    pub fn new(total_chunks: u32) -> Result<Self> {
        if total_chunks > crate::MAX_CHUNK_COUNT {
            return Err(Error::InvalidInput(format!(
                "chunk count {} exceeds limit {}",
                total_chunks,
                crate::MAX_CHUNK_COUNT
            )));
        }
        Ok(Self {
            slots: vec![None; total_chunks as usize],
            received: 0,
        })
    }

    /// Store a plaintext piece; idempotent
    ///
    /// Returns `true` when the slot was newly filled, `false` for a repeat
    /// delivery.
    pub fn insert(&mut self, index: u32, data: Bytes) -> Result<bool> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| Error::Protocol(format!("chunk index {} out of range", index)))?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(data);
        self.received += 1;
        Ok(true)
    }

    /// Whether the piece at `index` is already present
    pub fn contains(&self, index: u32) -> bool {
        self.slots
            .get(index as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Number of pieces received so far
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Total pieces expected
    pub fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Whether every index in `[0, total_chunks)` is present
    pub fn is_complete(&self) -> bool {
        self.received as usize == self.slots.len()
    }

    /// Indices still missing, ascending
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Concatenate all pieces in index order
    ///
    /// Fails with `IncompleteTransfer` when any piece is missing.
    pub fn assemble(&self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(Error::IncompleteTransfer {
                received: self.received,
                total: self.slots.len() as u32,
            });
        }
        let size: usize = self.slots.iter().flatten().map(|b| b.len()).sum();
        let mut out = BytesMut::with_capacity(size);
        for piece in self.slots.iter().flatten() {
            out.extend_from_slice(piece);
        }
        Ok(out.freeze())
    }

    /// Assemble and verify the whole-file hash
    ///
    /// Detects reassembly-order bugs even when every individual chunk hash
    /// matched.
    pub fn assemble_verified(
        &self,
        hash: HashAlgorithm,
        expected: &[u8; HASH_LEN],
    ) -> Result<Bytes> {
        let data = self.assemble()?;
        let actual = crypto::hash_bytes(hash, &data);
        if !crypto::hashes_equal(&actual, expected) {
            return Err(Error::FileHashMismatch);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(data: &'static [u8], chunk_size: usize) -> FileChunker {
        FileChunker::new(Bytes::from_static(data), chunk_size, HashAlgorithm::Blake3).unwrap()
    }

    #[test]
    fn test_chunk_count_and_sizes() {
        let data = vec![0xAAu8; crate::MIN_CHUNK_SIZE * 2 + 100];
        let chunker =
            FileChunker::new(Bytes::from(data), crate::MIN_CHUNK_SIZE, HashAlgorithm::Blake3)
                .unwrap();
        assert_eq!(chunker.total_chunks(), 3);
        assert_eq!(chunker.piece(0).unwrap().data.len(), crate::MIN_CHUNK_SIZE);
        assert_eq!(chunker.piece(2).unwrap().data.len(), 100);
        assert!(chunker.piece(3).is_none());
    }

    #[test]
    fn test_chunk_size_clamped() {
        let chunker = chunker(b"tiny", 1);
        assert_eq!(chunker.chunk_size(), crate::MIN_CHUNK_SIZE);
        assert_eq!(chunker.total_chunks(), 1);
    }

    #[test]
    fn test_roundtrip_out_of_order() {
        let data: Vec<u8> = (0..crate::MIN_CHUNK_SIZE * 3 + 7)
            .map(|i| (i % 251) as u8)
            .collect();
        let chunker =
            FileChunker::new(Bytes::from(data.clone()), crate::MIN_CHUNK_SIZE, HashAlgorithm::Blake3)
                .unwrap();
        let file_hash = chunker.file_hash();

        let mut reassembler = Reassembler::new(chunker.total_chunks()).unwrap();
        // Deliver in reverse order
        for index in (0..chunker.total_chunks()).rev() {
            let piece = chunker.piece(index).unwrap();
            assert!(reassembler.insert(index, piece.data).unwrap());
        }
        assert!(reassembler.is_complete());
        let rebuilt = reassembler
            .assemble_verified(HashAlgorithm::Blake3, &file_hash)
            .unwrap();
        assert_eq!(&rebuilt[..], &data[..]);
    }

    #[test]
    fn test_assemble_incomplete_fails() {
        let chunker = chunker(b"some test data", crate::MIN_CHUNK_SIZE);
        let mut reassembler = Reassembler::new(3).unwrap();
        reassembler
            .insert(0, chunker.piece(0).unwrap().data)
            .unwrap();
        let err = reassembler.assemble().unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteTransfer {
                received: 1,
                total: 3
            }
        ));
        assert_eq!(reassembler.missing(), vec![1, 2]);
    }

    #[test]
    fn test_idempotent_insert() {
        let chunker = chunker(b"idempotent chunk delivery", crate::MIN_CHUNK_SIZE);
        let mut reassembler = Reassembler::new(2).unwrap();
        let piece = chunker.piece(0).unwrap();
        assert!(reassembler.insert(0, piece.data.clone()).unwrap());
        assert!(!reassembler.insert(0, piece.data).unwrap());
        assert_eq!(reassembler.received(), 1);
    }

    #[test]
    fn test_out_of_range_insert_rejected() {
        let mut reassembler = Reassembler::new(2).unwrap();
        assert!(reassembler.insert(2, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_file_hash_mismatch_detected() {
        let chunker = chunker(b"original contents", crate::MIN_CHUNK_SIZE);
        let mut reassembler = Reassembler::new(1).unwrap();
        reassembler
            .insert(0, Bytes::from_static(b"corrupted contents"))
            .unwrap();
        let err = reassembler
            .assemble_verified(HashAlgorithm::Blake3, &chunker.file_hash())
            .unwrap_err();
        assert!(matches!(err, Error::FileHashMismatch));
    }

    #[test]
    fn test_empty_file() {
        let chunker = FileChunker::new(Bytes::new(), crate::DEFAULT_CHUNK_SIZE, HashAlgorithm::Blake3)
            .unwrap();
        assert_eq!(chunker.total_chunks(), 0);
        let reassembler = Reassembler::new(0).unwrap();
        assert!(reassembler.is_complete());
        assert!(reassembler.assemble().unwrap().is_empty());
    }
}
