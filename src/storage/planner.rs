//! Chunk Planner - decides how a file is cut and where each piece goes
//!
//! Splitting is fixed-size: every chunk is `max_chunk_size` bytes except the
//! last, which carries the remainder. Placement is first-fit over the ledger
//! snapshot in pool order, charging each chunk against the snapshot before
//! the next one is placed so that two chunks of the same file never count
//! the same free bytes.

use super::{AccountCapacity, AccountId, StorageError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A chunk as planned, before anything is uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    /// Position in the file
    pub order: u32,

    /// Byte offset of the chunk in the file
    pub offset: u64,

    /// Chunk length (bytes)
    pub size: u64,

    /// Account chosen to hold the chunk
    pub account_id: AccountId,
}

impl PlannedChunk {
    /// Byte range of this chunk within the file buffer
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// Ordered assignment of chunks to accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub max_chunk_size: u64,
    pub chunks: Vec<PlannedChunk>,
}

impl ChunkPlan {
    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Plans always hold at least one chunk
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether the file is stored as more than one chunk
    pub fn is_chunked(&self) -> bool {
        self.chunks.len() > 1
    }

    /// Bytes assigned to each account
    pub fn bytes_per_account(&self) -> BTreeMap<AccountId, u64> {
        let mut totals = BTreeMap::new();
        for chunk in &self.chunks {
            *totals.entry(chunk.account_id).or_insert(0) += chunk.size;
        }
        totals
    }
}

/// Computes chunk plans for a fixed maximum chunk size
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    max_chunk_size: u64,
}

impl ChunkPlanner {
    pub fn new(max_chunk_size: u64) -> Result<Self, StorageError> {
        if max_chunk_size == 0 {
            return Err(StorageError::InvalidChunkSize(max_chunk_size));
        }
        Ok(Self { max_chunk_size })
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    /// Chunk sizes for a file, in order.
    ///
    /// An empty file yields a single zero-size chunk so that upload and
    /// download handle it like any other file.
    pub fn chunk_sizes(&self, file_size: u64) -> Vec<u64> {
        if file_size <= self.max_chunk_size {
            return vec![file_size];
        }

        let full = file_size / self.max_chunk_size;
        let remainder = file_size % self.max_chunk_size;

        let mut sizes = vec![self.max_chunk_size; full as usize];
        if remainder > 0 {
            sizes.push(remainder);
        }
        sizes
    }

    /// Plan a file against a ledger snapshot.
    ///
    /// The snapshot order is the pool order. Fails with
    /// [`StorageError::NoCapacity`] naming the first chunk that fits nowhere.
    pub fn plan(
        &self,
        file_size: u64,
        snapshot: &[AccountCapacity],
    ) -> Result<ChunkPlan, StorageError> {
        let mut remaining: Vec<u64> = snapshot.iter().map(|a| a.available).collect();
        let sizes = self.chunk_sizes(file_size);
        let mut chunks = Vec::with_capacity(sizes.len());
        let mut offset = 0u64;

        for (order, size) in sizes.into_iter().enumerate() {
            let order = order as u32;
            let slot = remaining
                .iter()
                .position(|free| *free >= size)
                .ok_or(StorageError::NoCapacity { order, size })?;

            remaining[slot] -= size;
            chunks.push(PlannedChunk {
                order,
                offset,
                size,
                account_id: snapshot[slot].account_id,
            });
            offset += size;
        }

        Ok(ChunkPlan {
            file_size,
            max_chunk_size: self.max_chunk_size,
            chunks,
        })
    }
}
