//! File Index - persisted tables of users, accounts, folders, files and chunks
//!
//! The tables live in memory behind an async lock and are written out as a
//! JSON snapshot after every mutation. A mutation is applied to a copy of the
//! tables and only swapped in once the snapshot is on disk, so every call is
//! all-or-nothing: a chunk record and its account's new capacity are stored
//! together or not at all.

use super::{
    AccountId, BackingAccount, ChunkId, ChunkRecord, FileId, Folder, FolderId, LogicalFile,
    StorageError, UserId, UserRecord,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const INDEX_FILE: &str = "index.json";

/// Path of every user's root folder
pub const ROOT_FOLDER: &str = "home";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    users: BTreeMap<UserId, UserRecord>,
    accounts: BTreeMap<AccountId, BackingAccount>,
    folders: BTreeMap<FolderId, Folder>,
    files: BTreeMap<FileId, LogicalFile>,
    chunks: BTreeMap<ChunkId, ChunkRecord>,
}

impl Tables {
    fn folder_by_path(&self, owner: &UserId, path: &str) -> Option<&Folder> {
        self.folders
            .values()
            .find(|f| &f.owner == owner && f.path == path)
    }

    fn set_capacity(&mut self, account_id: &AccountId, available: u64) -> Result<(), StorageError> {
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or(StorageError::AccountNotFound(*account_id))?;
        account.available_capacity = available;
        Ok(())
    }
}

/// A user's folders and files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listing {
    pub folders: Vec<Folder>,
    pub files: Vec<LogicalFile>,
}

/// Reject names that would break the path namespace
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Persisted index of the drive
pub struct FileIndex {
    /// Snapshot location; `None` keeps the index in memory only
    path: Option<PathBuf>,

    tables: Mutex<Tables>,
}

impl FileIndex {
    /// Index that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Open (or create) the index stored in `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(INDEX_FILE);

        let tables = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StorageError::Serialization(format!("Failed to parse index: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded index from {} ({} files, {} chunks)",
            path.display(),
            tables.files.len(),
            tables.chunks.len()
        );

        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(tables)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize index: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Apply a mutation atomically: on any error the tables stay as they were
    async fn apply<T>(
        &self,
        mutate: impl FnOnce(&mut Tables) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let out = mutate(&mut next)?;
        self.persist(&next).await?;
        *tables = next;
        Ok(out)
    }

    // ----- users and accounts -----

    /// Create a user with its account pool and root folder
    pub async fn create_user(
        &self,
        user_id: &UserId,
        accounts: Vec<BackingAccount>,
    ) -> Result<Folder, StorageError> {
        let now = chrono::Utc::now().timestamp();
        self.apply(|t| {
            if t.users.contains_key(user_id) {
                return Err(StorageError::UserExists(user_id.clone()));
            }

            let root = Folder {
                id: FolderId::new(),
                owner: user_id.clone(),
                parent_id: None,
                name: "Home".to_string(),
                path: ROOT_FOLDER.to_string(),
                created_at: now,
            };

            t.users.insert(
                user_id.clone(),
                UserRecord {
                    user_id: user_id.clone(),
                    accounts: accounts.iter().map(|a| a.id).collect(),
                    created_at: now,
                },
            );
            for account in accounts {
                t.accounts.insert(account.id, account);
            }
            t.folders.insert(root.id, root.clone());
            Ok(root)
        })
        .await
    }

    /// Append an account to its owner's pool
    pub async fn add_account(&self, account: BackingAccount) -> Result<(), StorageError> {
        self.apply(|t| {
            let user = t
                .users
                .get_mut(&account.owner)
                .ok_or_else(|| StorageError::UserNotFound(account.owner.clone()))?;
            user.accounts.push(account.id);
            t.accounts.insert(account.id, account);
            Ok(())
        })
        .await
    }

    pub async fn user_exists(&self, user_id: &UserId) -> bool {
        self.tables.lock().await.users.contains_key(user_id)
    }

    /// Every account of every user
    pub async fn accounts(&self) -> Vec<BackingAccount> {
        self.tables.lock().await.accounts.values().cloned().collect()
    }

    pub async fn account(&self, account_id: &AccountId) -> Option<BackingAccount> {
        self.tables.lock().await.accounts.get(account_id).cloned()
    }

    /// A user's accounts in pool order
    pub async fn user_accounts(&self, user_id: &UserId) -> Result<Vec<BackingAccount>, StorageError> {
        let tables = self.tables.lock().await;
        let user = tables
            .users
            .get(user_id)
            .ok_or_else(|| StorageError::UserNotFound(user_id.clone()))?;

        Ok(user
            .accounts
            .iter()
            .filter_map(|id| tables.accounts.get(id).cloned())
            .collect())
    }

    // ----- folders -----

    pub async fn find_folder(&self, owner: &UserId, path: &str) -> Option<Folder> {
        self.tables.lock().await.folder_by_path(owner, path).cloned()
    }

    /// Create `parent_path/name`
    pub async fn create_folder(
        &self,
        owner: &UserId,
        parent_path: &str,
        name: &str,
    ) -> Result<Folder, StorageError> {
        validate_name(name)?;
        let now = chrono::Utc::now().timestamp();

        self.apply(|t| {
            let parent = t
                .folder_by_path(owner, parent_path)
                .ok_or_else(|| StorageError::FolderNotFound(parent_path.to_string()))?;

            let path = format!("{}/{}", parent.path, name);
            if t.folder_by_path(owner, &path).is_some() {
                return Err(StorageError::FolderExists(path));
            }

            let folder = Folder {
                id: FolderId::new(),
                owner: owner.clone(),
                parent_id: Some(parent.id),
                name: name.to_string(),
                path,
                created_at: now,
            };
            t.folders.insert(folder.id, folder.clone());
            Ok(folder)
        })
        .await
    }

    // ----- files and chunks -----

    pub async fn insert_file(&self, file: LogicalFile) -> Result<(), StorageError> {
        self.apply(|t| {
            match t.folders.get(&file.folder_id) {
                Some(folder) if folder.owner == file.owner => {}
                _ => return Err(StorageError::FolderNotFound(file.path.clone())),
            }
            t.files.insert(file.id, file);
            Ok(())
        })
        .await
    }

    pub async fn file(&self, file_id: &FileId) -> Option<LogicalFile> {
        self.tables.lock().await.files.get(file_id).cloned()
    }

    /// A file, provided it belongs to `owner`
    pub async fn owned_file(
        &self,
        file_id: &FileId,
        owner: &UserId,
    ) -> Result<LogicalFile, StorageError> {
        match self.file(file_id).await {
            Some(file) if &file.owner == owner => Ok(file),
            _ => Err(StorageError::FileNotFound(*file_id)),
        }
    }

    /// Chunks of a file sorted by `order`
    pub async fn chunks_for_file(&self, file_id: &FileId) -> Vec<ChunkRecord> {
        let tables = self.tables.lock().await;
        let mut chunks: Vec<ChunkRecord> = tables
            .chunks
            .values()
            .filter(|c| &c.file_id == file_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.order);
        chunks
    }

    /// Store a chunk record and its account's new free capacity together
    pub async fn record_chunk(
        &self,
        record: ChunkRecord,
        account_available: u64,
    ) -> Result<(), StorageError> {
        self.apply(|t| {
            if !t.files.contains_key(&record.file_id) {
                return Err(StorageError::FileNotFound(record.file_id));
            }
            if t
                .chunks
                .values()
                .any(|c| c.file_id == record.file_id && c.order == record.order)
            {
                return Err(StorageError::DuplicateChunk {
                    file_id: record.file_id,
                    order: record.order,
                });
            }
            t.set_capacity(&record.account_id, account_available)?;
            t.chunks.insert(record.id, record);
            Ok(())
        })
        .await
    }

    /// Drop a chunk record and store its account's new free capacity together
    pub async fn remove_chunk(
        &self,
        chunk_id: &ChunkId,
        account_available: u64,
    ) -> Result<ChunkRecord, StorageError> {
        self.apply(|t| {
            let record = t
                .chunks
                .remove(chunk_id)
                .ok_or(StorageError::ChunkNotFound(*chunk_id))?;
            t.set_capacity(&record.account_id, account_available)?;
            Ok(record)
        })
        .await
    }

    /// Remove a file that has no chunks left. Returns `false` if it was already gone.
    pub async fn remove_file(&self, file_id: &FileId) -> Result<bool, StorageError> {
        self.apply(|t| {
            if t.chunks.values().any(|c| &c.file_id == file_id) {
                return Err(StorageError::FileNotEmpty(*file_id));
            }
            Ok(t.files.remove(file_id).is_some())
        })
        .await
    }

    /// A user's folders and files, sorted by path
    pub async fn list(&self, owner: &UserId) -> Listing {
        let tables = self.tables.lock().await;

        let mut folders: Vec<Folder> = tables
            .folders
            .values()
            .filter(|f| &f.owner == owner)
            .cloned()
            .collect();
        folders.sort_by(|a, b| a.path.cmp(&b.path));

        let mut files: Vec<LogicalFile> = tables
            .files
            .values()
            .filter(|f| &f.owner == owner)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Listing { folders, files }
    }
}
