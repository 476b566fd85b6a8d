//! PoolDrive - user-facing file operations over a pool of backing accounts
//!
//! Ties the planner, ledger, index and executor together. Every user owns a
//! private pool of accounts; files they upload are cut into chunks and spread
//! over that pool.

use crate::backend::{AccountIdentity, BackingStore};
use crate::crypto::ContentHash;
use crate::storage::{
    validate_name, AccountId, AccountLedger, BackingAccount, ChunkPlan, ChunkPlanner, FileId,
    FileIndex, Folder, Listing, LogicalFile, PlacementExecutor, StorageError, UserId,
};
use crate::{PoolDriveConfig, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An account to add to a user's pool
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub identity: AccountIdentity,

    /// Quota in bytes; `None` uses the configured default
    pub capacity: Option<u64>,
}

impl AccountSpec {
    pub fn new(identity: AccountIdentity) -> Self {
        Self {
            identity,
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Capacity figures for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUsage {
    pub account_id: AccountId,
    pub login: String,
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// Capacity figures for a user's whole pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    /// In pool order
    pub accounts: Vec<AccountUsage>,
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// Chunked file storage over capacity-limited backing accounts
pub struct PoolDrive {
    config: PoolDriveConfig,
    planner: ChunkPlanner,
    index: Arc<FileIndex>,
    ledger: Arc<AccountLedger>,
    executor: PlacementExecutor,
}

impl PoolDrive {
    /// Open a drive, loading the index from `config.data_path` if set
    pub async fn open(config: PoolDriveConfig, backend: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate()?;

        let index = match &config.data_path {
            Some(dir) => FileIndex::open(dir).await?,
            None => FileIndex::in_memory(),
        };
        let index = Arc::new(index);
        let ledger = Arc::new(AccountLedger::from_accounts(&index.accounts().await));
        let planner = ChunkPlanner::new(config.max_chunk_size)?;

        let executor = PlacementExecutor::new(backend, Arc::clone(&ledger), Arc::clone(&index))
            .with_download_concurrency(config.download_concurrency)
            .with_integrity_checks(config.verify_integrity);

        Ok(Self {
            config,
            planner,
            index,
            ledger,
            executor,
        })
    }

    pub fn config(&self) -> &PoolDriveConfig {
        &self.config
    }

    fn backing_account(&self, owner: &UserId, spec: AccountSpec) -> BackingAccount {
        let capacity = spec
            .capacity
            .unwrap_or(self.config.default_account_capacity);

        BackingAccount {
            id: AccountId::new(),
            owner: owner.clone(),
            identity: spec.identity,
            total_capacity: capacity,
            available_capacity: capacity,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    // ----- users and folders -----

    /// Create a user with its account pool. Returns the user's root folder.
    pub async fn register_user(&self, user: &UserId, accounts: Vec<AccountSpec>) -> Result<Folder> {
        let accounts: Vec<BackingAccount> = accounts
            .into_iter()
            .map(|spec| self.backing_account(user, spec))
            .collect();

        let root = self.index.create_user(user, accounts.clone()).await?;
        for account in &accounts {
            self.ledger.register(account);
        }

        tracing::info!("Registered user {} with {} account(s)", user, accounts.len());
        Ok(root)
    }

    /// Append an account to the end of a user's pool
    pub async fn add_account(&self, user: &UserId, spec: AccountSpec) -> Result<AccountId> {
        let account = self.backing_account(user, spec);
        let account_id = account.id;

        self.index.add_account(account.clone()).await?;
        self.ledger.register(&account);

        tracing::info!(
            "Added account {} ({} bytes) to user {}",
            account_id,
            account.total_capacity,
            user
        );
        Ok(account_id)
    }

    /// Create `parent_path/name` and return it
    pub async fn create_folder(&self, user: &UserId, parent_path: &str, name: &str) -> Result<Folder> {
        if !self.index.user_exists(user).await {
            return Err(StorageError::UserNotFound(user.clone()).into());
        }
        Ok(self.index.create_folder(user, parent_path, name).await?)
    }

    // ----- files -----

    /// Store `data` as `folder_path/name`.
    ///
    /// Capacity for every chunk is reserved before the first byte is sent.
    /// If a chunk fails afterwards, the chunks already placed stay where they
    /// are and are reported in the error.
    pub async fn upload(
        &self,
        user: &UserId,
        folder_path: &str,
        name: &str,
        data: &[u8],
    ) -> Result<FileId> {
        validate_name(name)?;
        let accounts = self.index.user_accounts(user).await?;
        let folder = self
            .index
            .find_folder(user, folder_path)
            .await
            .ok_or_else(|| StorageError::FolderNotFound(folder_path.to_string()))?;

        let plan = self.reserve(&accounts, data.len() as u64).await?;

        let file = LogicalFile {
            id: FileId::new(),
            owner: user.clone(),
            folder_id: folder.id,
            name: name.to_string(),
            path: format!("{}/{}", folder.path, name),
            total_size: data.len() as u64,
            is_chunked: plan.is_chunked(),
            mime_type: mime_guess::from_path(name)
                .first_or_octet_stream()
                .to_string(),
            content_hash: ContentHash::hash(data),
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Err(err) = self.index.insert_file(file.clone()).await {
            self.ledger.cancel_chunks(&plan.chunks).await;
            return Err(err.into());
        }

        self.executor.place_file(&file, data, &plan).await?;

        tracing::info!(
            "Uploaded {} ({} bytes in {} chunk(s))",
            file.path,
            file.total_size,
            plan.len()
        );
        Ok(file.id)
    }

    /// Plan against a fresh snapshot and reserve the plan.
    ///
    /// Planning failures are final. Losing a reservation race to a
    /// concurrent upload triggers a re-plan, up to `reservation_attempts`.
    async fn reserve(&self, accounts: &[BackingAccount], size: u64) -> Result<ChunkPlan> {
        let ids: Vec<AccountId> = accounts.iter().map(|a| a.id).collect();
        let mut attempt = 1;

        loop {
            let snapshot = self.ledger.snapshot(&ids).await;
            let plan = self.planner.plan(size, &snapshot)?;

            match self.ledger.reserve_plan(&plan).await {
                Ok(()) => return Ok(plan),
                Err(StorageError::NoCapacity { order, .. })
                    if attempt < self.config.reservation_attempts =>
                {
                    tracing::debug!(
                        "Reservation of chunk {} lost to a concurrent upload, re-planning (attempt {})",
                        order,
                        attempt
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fetch a file owned by `user`
    pub async fn download(&self, file_id: &FileId, user: &UserId) -> Result<Vec<u8>> {
        let file = self.index.owned_file(file_id, user).await?;
        Ok(self.executor.assemble_file(&file).await?)
    }

    /// Delete a file owned by `user` and free its capacity
    pub async fn delete(&self, file_id: &FileId, user: &UserId) -> Result<()> {
        let file = self.index.owned_file(file_id, user).await?;
        Ok(self.executor.delete_file(&file).await?)
    }

    /// Metadata of a file owned by `user`
    pub async fn file(&self, file_id: &FileId, user: &UserId) -> Result<LogicalFile> {
        Ok(self.index.owned_file(file_id, user).await?)
    }

    /// All folders and files of a user
    pub async fn list(&self, user: &UserId) -> Result<Listing> {
        if !self.index.user_exists(user).await {
            return Err(StorageError::UserNotFound(user.clone()).into());
        }
        Ok(self.index.list(user).await)
    }

    /// Persisted capacity of every account in a user's pool
    pub async fn usage(&self, user: &UserId) -> Result<UsageReport> {
        let accounts = self.index.user_accounts(user).await?;
        let mut report = UsageReport::default();

        for account in accounts {
            report.total += account.total_capacity;
            report.available += account.available_capacity;
            report.used += account.used_capacity();
            report.accounts.push(AccountUsage {
                account_id: account.id,
                login: account.identity.login.clone(),
                total: account.total_capacity,
                available: account.available_capacity,
                used: account.used_capacity(),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, MemoryBackend};
    use crate::PoolDriveError;
    use tempfile::tempdir;

    fn config(max_chunk_size: u64) -> PoolDriveConfig {
        PoolDriveConfig {
            max_chunk_size,
            ..PoolDriveConfig::default()
        }
    }

    fn account(backend: &MemoryBackend, login: &str, capacity: u64) -> AccountSpec {
        let identity = AccountIdentity::new(login, "pw");
        backend.register_account(&identity);
        AccountSpec::new(identity).with_capacity(capacity)
    }

    async fn drive_with(
        max_chunk_size: u64,
        capacities: &[u64],
    ) -> (PoolDrive, Arc<MemoryBackend>, UserId) {
        let backend = Arc::new(MemoryBackend::new());
        let drive = PoolDrive::open(config(max_chunk_size), backend.clone())
            .await
            .unwrap();
        let user = UserId::new("alice");

        let accounts = capacities
            .iter()
            .enumerate()
            .map(|(i, &c)| account(&backend, &format!("a{}@example.com", i), c))
            .collect();
        drive.register_user(&user, accounts).await.unwrap();

        (drive, backend, user)
    }

    fn is_storage(err: &PoolDriveError, check: impl Fn(&StorageError) -> bool) -> bool {
        matches!(err, PoolDriveError::Storage(inner) if check(inner))
    }

    #[tokio::test]
    async fn test_fifteen_bytes_over_two_accounts() {
        let (drive, backend, user) = drive_with(8, &[10, 10]).await;
        let data: Vec<u8> = (0u8..15).collect();

        let file_id = drive.upload(&user, "home", "numbers.bin", &data).await.unwrap();

        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.accounts[0].available, 2);
        assert_eq!(usage.accounts[1].available, 3);
        assert_eq!(usage.used, 15);
        assert_eq!(backend.blob_count("a0@example.com"), 1);
        assert_eq!(backend.blob_count("a1@example.com"), 1);

        let file = drive.file(&file_id, &user).await.unwrap();
        assert!(file.is_chunked);
        assert_eq!(file.path, "home/numbers.bin");

        assert_eq!(drive.download(&file_id, &user).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_single_chunk_round_trip() {
        let (drive, _backend, user) = drive_with(1024, &[4096]).await;
        let data = b"hello pooled storage".to_vec();

        let file_id = drive.upload(&user, "home", "hello.txt", &data).await.unwrap();
        let file = drive.file(&file_id, &user).await.unwrap();

        assert!(!file.is_chunked);
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(drive.download(&file_id, &user).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_large_file_round_trip() {
        let (drive, _backend, user) = drive_with(100, &[350, 350, 400]).await;
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let file_id = drive.upload(&user, "home", "big.bin", &data).await.unwrap();

        let usage = drive.usage(&user).await.unwrap();
        let used: Vec<u64> = usage.accounts.iter().map(|a| a.used).collect();
        assert_eq!(used, vec![300, 300, 400]);
        assert_eq!(usage.available, 100);

        assert!(drive.upload(&user, "home", "x", &[0u8; 60]).await.is_err());
        assert_eq!(drive.download(&file_id, &user).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (drive, backend, user) = drive_with(8, &[10]).await;

        let file_id = drive.upload(&user, "home", "empty", &[]).await.unwrap();

        assert_eq!(backend.total_blobs(), 1);
        assert!(drive.download(&file_id, &user).await.unwrap().is_empty());
        assert_eq!(drive.usage(&user).await.unwrap().available, 10);

        drive.delete(&file_id, &user).await.unwrap();
        assert_eq!(backend.total_blobs(), 0);
    }

    #[tokio::test]
    async fn test_no_capacity_is_preflight() {
        let (drive, backend, user) = drive_with(8, &[10, 5]).await;

        let err = drive
            .upload(&user, "home", "too-big", &[1u8; 16])
            .await
            .unwrap_err();

        assert!(is_storage(&err, |e| matches!(
            e,
            StorageError::NoCapacity { order: 1, size: 8 }
        )));
        assert_eq!(backend.total_blobs(), 0);
        assert!(drive.list(&user).await.unwrap().files.is_empty());
        assert_eq!(drive.usage(&user).await.unwrap().available, 15);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_cannot_share_capacity() {
        let (drive, backend, user) = drive_with(16, &[10]).await;

        let (first, second) = tokio::join!(
            drive.upload(&user, "home", "one", &[1u8; 10]),
            drive.upload(&user, "home", "two", &[2u8; 10]),
        );

        let outcomes = [&first, &second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(err) if is_storage(err, |e| matches!(e, StorageError::NoCapacity { .. }))
        )));

        assert_eq!(backend.total_blobs(), 1);
        assert_eq!(drive.usage(&user).await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn test_many_concurrent_uploads_never_overcommit() {
        let (drive, _backend, user) = drive_with(4, &[20, 20]).await;
        let drive = Arc::new(drive);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let drive = Arc::clone(&drive);
                let user = user.clone();
                tokio::spawn(async move {
                    drive
                        .upload(&user, "home", &format!("f{}", i), &[i as u8; 6])
                        .await
                })
            })
            .collect();

        let mut stored = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                stored += 1;
            }
        }

        // 6 bytes split 4 + 2: at most 6 files fit into 40 bytes
        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.used, stored * 6);
        assert!(usage.accounts.iter().all(|a| a.used <= a.total));
        assert_eq!(drive.list(&user).await.unwrap().files.len() as u64, stored);
    }

    #[tokio::test]
    async fn test_folders() {
        let (drive, _backend, user) = drive_with(8, &[100]).await;

        let docs = drive.create_folder(&user, "home", "docs").await.unwrap();
        assert_eq!(docs.path, "home/docs");
        drive.create_folder(&user, "home/docs", "2024").await.unwrap();

        let file_id = drive.upload(&user, "home/docs/2024", "notes.md", b"# notes").await.unwrap();
        assert_eq!(
            drive.file(&file_id, &user).await.unwrap().path,
            "home/docs/2024/notes.md"
        );

        let err = drive.upload(&user, "home/missing", "a", b"a").await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FolderNotFound(_))));

        let err = drive.create_folder(&user, "home", "docs").await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FolderExists(_))));

        let err = drive.upload(&user, "home", "a/b", b"a").await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::InvalidName(_))));

        let listing = drive.list(&user).await.unwrap();
        let paths: Vec<_> = listing.folders.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["home", "home/docs", "home/docs/2024"]);
        assert_eq!(listing.files.len(), 1);
    }

    #[tokio::test]
    async fn test_files_are_private_to_their_owner() {
        let (drive, backend, alice) = drive_with(8, &[100]).await;
        let bob = UserId::new("bob");
        drive
            .register_user(&bob, vec![account(&backend, "bob@example.com", 100)])
            .await
            .unwrap();

        let file_id = drive.upload(&alice, "home", "secret", b"alice only").await.unwrap();

        let err = drive.download(&file_id, &bob).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FileNotFound(_))));
        let err = drive.delete(&file_id, &bob).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FileNotFound(_))));

        assert!(drive.list(&bob).await.unwrap().files.is_empty());
        assert_eq!(drive.download(&file_id, &alice).await.unwrap(), b"alice only");
    }

    #[tokio::test]
    async fn test_user_provisioning() {
        let (drive, backend, user) = drive_with(8, &[10]).await;

        let err = drive.register_user(&user, vec![]).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::UserExists(_))));

        let stranger = UserId::new("nobody");
        let err = drive.upload(&stranger, "home", "f", b"x").await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::UserNotFound(_))));

        // A new account joins the end of the pool
        let extra = drive
            .add_account(&user, account(&backend, "extra@example.com", 20))
            .await
            .unwrap();
        drive.upload(&user, "home", "f", &[7u8; 16]).await.unwrap();

        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.accounts.len(), 2);
        assert_eq!(usage.accounts[1].account_id, extra);
        assert_eq!(usage.accounts[0].used, 8);
        assert_eq!(usage.accounts[1].used, 8);
    }

    #[tokio::test]
    async fn test_default_account_capacity() {
        let backend = Arc::new(MemoryBackend::new());
        let drive = PoolDrive::open(PoolDriveConfig::default(), backend.clone())
            .await
            .unwrap();
        let user = UserId::new("alice");
        let identity = AccountIdentity::new("a@example.com", "pw");
        backend.register_account(&identity);

        drive
            .register_user(&user, vec![AccountSpec::new(identity)])
            .await
            .unwrap();

        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.total, drive.config().default_account_capacity);
    }

    #[tokio::test]
    async fn test_failed_upload_reports_placed_chunks() {
        let (drive, backend, user) = drive_with(8, &[10, 10, 10]).await;

        backend.fail_uploads_after(2);
        let err = drive.upload(&user, "home", "f", &[3u8; 24]).await.unwrap_err();

        match err {
            PoolDriveError::Storage(inner) => {
                assert!(inner.is_backend());
                assert_eq!(inner.placed_chunks().len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Chunks 0 and 1 stay committed, the file is listed but unreadable
        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.used, 16);
        let listing = drive.list(&user).await.unwrap();
        assert_eq!(listing.files.len(), 1);
        let file_id = listing.files[0].id;
        assert!(drive.download(&file_id, &user).await.is_err());

        // Deleting the partial file frees what it holds
        backend.clear_faults();
        drive.delete(&file_id, &user).await.unwrap();
        assert_eq!(drive.usage(&user).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_delete_frees_capacity() {
        let (drive, backend, user) = drive_with(8, &[10, 10]).await;

        let file_id = drive.upload(&user, "home", "f", &[1u8; 15]).await.unwrap();
        drive.delete(&file_id, &user).await.unwrap();

        assert_eq!(drive.usage(&user).await.unwrap().available, 20);
        assert_eq!(backend.total_blobs(), 0);

        let err = drive.download(&file_id, &user).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FileNotFound(_))));
        let err = drive.delete(&file_id, &user).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::FileNotFound(_))));

        // Freed space is usable again
        drive.upload(&user, "home", "g", &[2u8; 16]).await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_drive_on_local_backend() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn BackingStore> = Arc::new(LocalBackend::new(dir.path().join("blobs")));
        let config = PoolDriveConfig {
            max_chunk_size: 8,
            data_path: Some(dir.path().join("index")),
            ..PoolDriveConfig::default()
        };
        let user = UserId::new("alice");
        let data: Vec<u8> = (0u8..15).collect();

        let file_id = {
            let drive = PoolDrive::open(config.clone(), Arc::clone(&backend)).await.unwrap();
            let accounts = vec![
                AccountSpec::new(AccountIdentity::new("a@example.com", "pw")).with_capacity(10),
                AccountSpec::new(AccountIdentity::new("b@example.com", "pw")).with_capacity(10),
            ];
            drive.register_user(&user, accounts).await.unwrap();
            drive.upload(&user, "home", "data.bin", &data).await.unwrap()
        };

        // A reopened drive sees the same files and capacity
        let drive = PoolDrive::open(config, backend).await.unwrap();
        assert_eq!(drive.download(&file_id, &user).await.unwrap(), data);

        let usage = drive.usage(&user).await.unwrap();
        assert_eq!(usage.accounts[0].available, 2);
        assert_eq!(usage.accounts[1].available, 3);

        // The ledger was rebuilt from the index: account A cannot take 8 more
        drive.upload(&user, "home", "more.bin", &[9u8; 3]).await.unwrap();
        let err = drive.upload(&user, "home", "too.bin", &[9u8; 8]).await.unwrap_err();
        assert!(is_storage(&err, |e| matches!(e, StorageError::NoCapacity { .. })));

        drive.delete(&file_id, &user).await.unwrap();
        assert_eq!(drive.usage(&user).await.unwrap().used, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_on_fresh_local_account() {
        for _ in 0..5 {
            let dir = tempdir().unwrap();
            let backend: Arc<dyn BackingStore> = Arc::new(LocalBackend::new(dir.path()));
            let drive = Arc::new(PoolDrive::open(config(8), backend).await.unwrap());
            let user = UserId::new("alice");
            let identity = AccountIdentity::new("a@example.com", "pw");
            drive
                .register_user(&user, vec![AccountSpec::new(identity).with_capacity(1000)])
                .await
                .unwrap();

            // Every upload opens its own first session on the same account
            let handles: Vec<_> = (0..6u8)
                .map(|i| {
                    let drive = Arc::clone(&drive);
                    let user = user.clone();
                    tokio::spawn(async move {
                        drive
                            .upload(&user, "home", &format!("f{}", i), &[i; 4])
                            .await
                    })
                })
                .collect();

            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            assert_eq!(drive.list(&user).await.unwrap().files.len(), 6);
            assert_eq!(drive.usage(&user).await.unwrap().used, 24);
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let result = PoolDrive::open(config(0), backend).await;
        assert!(matches!(result, Err(PoolDriveError::Config(_))));
    }
}
