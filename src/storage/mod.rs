//! Storage Module - chunk allocation across a pool of backing accounts
//!
//! Plans how a file is cut into chunks, reserves capacity for them, places
//! them on backing accounts and keeps the persisted index of where every
//! chunk lives.

mod index;
mod ledger;
mod model;
mod placement;
mod planner;

pub use index::{FileIndex, Listing, ROOT_FOLDER};
pub(crate) use index::validate_name;
pub use ledger::{AccountCapacity, AccountLedger};
pub use model::{
    AccountId, BackingAccount, ChunkId, ChunkRecord, FileId, Folder, FolderId, LogicalFile,
    UserId, UserRecord,
};
pub use placement::PlacementExecutor;
pub use planner::{ChunkPlan, ChunkPlanner, PlannedChunk};

use crate::backend::{BackendError, BlobHandle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("User already exists: {0}")]
    UserExists(UserId),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Folder already exists: {0}")]
    FolderExists(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    FileNotFound(FileId),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("No account can hold chunk {order} ({size} bytes)")]
    NoCapacity { order: u32, size: u64 },

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("Chunk {order} of file {file_id} failed on account {account_id}: {source}")]
    ChunkUpload {
        file_id: FileId,
        order: u32,
        account_id: AccountId,
        source: BackendError,
        /// Chunks committed before the failure; they stay in place
        placed: Vec<ChunkRecord>,
    },

    #[error("Chunk {order} of file {file_id} stored as {handle} on account {account_id} but not recorded: {reason}")]
    ChunkNotRecorded {
        file_id: FileId,
        order: u32,
        account_id: AccountId,
        handle: BlobHandle,
        reason: String,
        placed: Vec<ChunkRecord>,
    },

    #[error("Chunk {order} of file {file_id} could not be fetched from account {account_id}: {source}")]
    ChunkFetch {
        file_id: FileId,
        order: u32,
        account_id: AccountId,
        source: BackendError,
    },

    #[error("Delete of file {file_id} incomplete, {} chunk(s) remain; chunk {order} on account {account_id} failed: {source}", .remaining.len())]
    DeleteIncomplete {
        file_id: FileId,
        /// Chunks still recorded (and still holding capacity)
        remaining: Vec<ChunkId>,
        order: u32,
        account_id: AccountId,
        source: BackendError,
    },

    #[error("File {file_id} is incomplete: expected {expected} bytes in contiguous chunks, index holds {found}")]
    IncompleteFile {
        file_id: FileId,
        expected: u64,
        found: u64,
    },

    #[error("Duplicate chunk order {order} for file {file_id}")]
    DuplicateChunk { file_id: FileId, order: u32 },

    #[error("Integrity check failed for file {file_id} (chunk {order:?})")]
    IntegrityCheckFailed { file_id: FileId, order: Option<u32> },

    #[error("File {0} still has chunks")]
    FileNotEmpty(FileId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Chunks that were committed before an upload failed
    pub fn placed_chunks(&self) -> &[ChunkRecord] {
        match self {
            StorageError::ChunkUpload { placed, .. }
            | StorageError::ChunkNotRecorded { placed, .. } => placed,
            _ => &[],
        }
    }

    /// Whether the error came from the backing store
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            StorageError::ChunkUpload { .. }
                | StorageError::ChunkFetch { .. }
                | StorageError::DeleteIncomplete { .. }
        )
    }
}
