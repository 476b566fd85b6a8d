//! Persisted records: accounts, folders, logical files and their chunks

use crate::backend::{AccountIdentity, BlobHandle};
use crate::crypto::ContentHash;

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a backing account
    AccountId
);
uuid_id!(
    /// Identifier of a logical file
    FileId
);
uuid_id!(
    /// Identifier of a chunk record
    ChunkId
);
uuid_id!(
    /// Identifier of a folder
    FolderId
);

/// Identifier of a drive user, assigned by the surrounding service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user and the ordered pool of accounts that back their files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,

    /// Pool order; the planner fills accounts first to last
    pub accounts: Vec<AccountId>,

    pub created_at: i64,
}

/// A third-party storage account owned by one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackingAccount {
    pub id: AccountId,

    pub owner: UserId,

    /// Provider credentials
    pub identity: AccountIdentity,

    /// Quota granted by the provider (bytes)
    pub total_capacity: u64,

    /// Bytes still free; only the ledger changes this
    pub available_capacity: u64,

    pub created_at: i64,
}

impl BackingAccount {
    /// Bytes occupied by committed chunks
    pub fn used_capacity(&self) -> u64 {
        self.total_capacity.saturating_sub(self.available_capacity)
    }
}

/// Folder in a user's path namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,

    pub owner: UserId,

    /// `None` for the root folder
    pub parent_id: Option<FolderId>,

    pub name: String,

    /// Full path, e.g. `home/photos`
    pub path: String,

    pub created_at: i64,
}

/// A file as the user sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalFile {
    pub id: FileId,

    pub owner: UserId,

    pub folder_id: FolderId,

    /// File name inside its folder
    pub name: String,

    /// `folder path/name`
    pub path: String,

    /// Size of the original file (bytes)
    pub total_size: u64,

    /// Stored as more than one chunk
    pub is_chunked: bool,

    pub mime_type: String,

    /// Hash of the whole original file
    pub content_hash: ContentHash,

    pub created_at: i64,
}

/// One physical chunk of a logical file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,

    pub file_id: FileId,

    pub account_id: AccountId,

    /// Position in the file, 0-based and dense
    pub order: u32,

    /// Handle returned by the backing store
    pub remote_handle: BlobHandle,

    /// Chunk size (bytes)
    pub size: u64,

    /// Hash of the chunk bytes
    pub content_hash: ContentHash,

    pub created_at: i64,
}
