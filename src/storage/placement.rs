//! Placement Executor - moves chunks between the index and the backing store
//!
//! Upload and delete walk a file's chunks one at a time. Download fetches
//! chunks concurrently but stitches them together strictly by `order`.

use super::{
    AccountId, AccountLedger, BackingAccount, ChunkId, ChunkPlan, ChunkRecord, FileId,
    FileIndex, LogicalFile, PlannedChunk, StorageError,
};
use crate::backend::{BackendError, BackingStore, BlobHandle, Session};
use crate::crypto::{ContentHash, IncrementalHasher};

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

/// Why a single chunk operation failed
enum ChunkFailure {
    /// The backing store refused the call
    Backend(BackendError),

    /// The blob was uploaded but its record could not be stored
    NotRecorded { handle: BlobHandle, reason: String },

    /// The index could not be read or written
    Index(StorageError),
}

/// Executes chunk plans against a [`BackingStore`]
pub struct PlacementExecutor {
    backend: Arc<dyn BackingStore>,
    ledger: Arc<AccountLedger>,
    index: Arc<FileIndex>,

    /// One open session per account
    sessions: DashMap<AccountId, Session>,

    download_concurrency: usize,
    verify_integrity: bool,
}

impl PlacementExecutor {
    pub fn new(
        backend: Arc<dyn BackingStore>,
        ledger: Arc<AccountLedger>,
        index: Arc<FileIndex>,
    ) -> Self {
        Self {
            backend,
            ledger,
            index,
            sessions: DashMap::new(),
            download_concurrency: 4,
            verify_integrity: true,
        }
    }

    /// Limit the number of chunk fetches in flight per download
    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency.max(1);
        self
    }

    /// Enable or disable hash verification on download
    pub fn with_integrity_checks(mut self, enabled: bool) -> Self {
        self.verify_integrity = enabled;
        self
    }

    async fn session(&self, account: &BackingAccount) -> Result<Session, BackendError> {
        if let Some(session) = self.sessions.get(&account.id).map(|s| s.clone()) {
            return Ok(session);
        }

        let session = self.backend.login(&account.identity).await?;
        tracing::debug!("Opened {} session for account {}", self.backend.name(), account.id);
        self.sessions.insert(account.id, session.clone());
        Ok(session)
    }

    fn forget_session_on(&self, account_id: &AccountId, err: &BackendError) {
        if err.invalidates_session() {
            self.sessions.remove(account_id);
        }
    }

    async fn account(&self, account_id: &AccountId) -> Result<BackingAccount, StorageError> {
        self.index
            .account(account_id)
            .await
            .ok_or(StorageError::AccountNotFound(*account_id))
    }

    // ----- upload -----

    /// Upload every chunk of `plan`, in order.
    ///
    /// Every chunk of the plan must already hold a ledger reservation. On
    /// failure the chunks placed so far stay committed and are returned in
    /// the error; the reservations of the chunks not yet attempted are
    /// cancelled.
    pub async fn place_file(
        &self,
        file: &LogicalFile,
        data: &[u8],
        plan: &ChunkPlan,
    ) -> Result<Vec<ChunkRecord>, StorageError> {
        let mut placed = Vec::with_capacity(plan.len());

        for (i, chunk) in plan.chunks.iter().enumerate() {
            match self.place_chunk(file, data, chunk).await {
                Ok(record) => placed.push(record),
                Err(failure) => {
                    self.ledger.cancel_chunks(&plan.chunks[i + 1..]).await;
                    tracing::warn!(
                        "Upload of {} stopped at chunk {}/{}; {} chunk(s) left in place",
                        file.path,
                        chunk.order,
                        plan.len(),
                        placed.len()
                    );

                    return Err(match failure {
                        ChunkFailure::Backend(source) => StorageError::ChunkUpload {
                            file_id: file.id,
                            order: chunk.order,
                            account_id: chunk.account_id,
                            source,
                            placed,
                        },
                        ChunkFailure::NotRecorded { handle, reason } => {
                            StorageError::ChunkNotRecorded {
                                file_id: file.id,
                                order: chunk.order,
                                account_id: chunk.account_id,
                                handle,
                                reason,
                                placed,
                            }
                        }
                        ChunkFailure::Index(err) => err,
                    });
                }
            }
        }

        Ok(placed)
    }

    async fn place_chunk(
        &self,
        file: &LogicalFile,
        data: &[u8],
        chunk: &PlannedChunk,
    ) -> Result<ChunkRecord, ChunkFailure> {
        let account = match self.account(&chunk.account_id).await {
            Ok(account) => account,
            Err(err) => {
                self.ledger.cancel(&chunk.account_id, chunk.size).await;
                return Err(ChunkFailure::Index(err));
            }
        };

        let bytes = &data[chunk.range()];
        let name_hint = format!("{}.part{}", file.id, chunk.order);

        let uploaded = match self.session(&account).await {
            Ok(session) => self.backend.upload(&session, bytes, &name_hint).await,
            Err(err) => Err(err),
        };
        let handle = match uploaded {
            Ok(handle) => handle,
            Err(err) => {
                self.forget_session_on(&account.id, &err);
                self.ledger.cancel(&account.id, chunk.size).await;
                return Err(ChunkFailure::Backend(err));
            }
        };

        let record = ChunkRecord {
            id: ChunkId::new(),
            file_id: file.id,
            account_id: account.id,
            order: chunk.order,
            remote_handle: handle.clone(),
            size: chunk.size,
            content_hash: ContentHash::hash(bytes),
            created_at: chrono::Utc::now().timestamp(),
        };

        let committed = self
            .ledger
            .commit(&account.id, chunk.size, |available| {
                self.index.record_chunk(record.clone(), available)
            })
            .await;

        match committed {
            Ok(available) => {
                tracing::debug!(
                    "Placed chunk {} of {} ({} bytes) on account {} ({} bytes left)",
                    chunk.order,
                    file.id,
                    chunk.size,
                    account.id,
                    available
                );
                Ok(record)
            }
            Err(err) => {
                tracing::warn!(
                    "Orphaned blob {} on account {}: chunk {} of {} could not be recorded: {}",
                    handle,
                    account.id,
                    chunk.order,
                    file.id,
                    err
                );
                Err(ChunkFailure::NotRecorded {
                    handle,
                    reason: err.to_string(),
                })
            }
        }
    }

    // ----- download -----

    /// Fetch and reassemble a file
    pub async fn assemble_file(&self, file: &LogicalFile) -> Result<Vec<u8>, StorageError> {
        let chunks = self.index.chunks_for_file(&file.id).await;
        Self::check_complete(file, &chunks)?;

        let parts: Vec<Vec<u8>> = futures::stream::iter(
            chunks.iter().map(|chunk| self.fetch_chunk(file.id, chunk)),
        )
        .buffered(self.download_concurrency)
        .try_collect()
        .await?;

        let mut hasher = IncrementalHasher::new();
        let mut data = Vec::with_capacity(file.total_size as usize);
        for part in &parts {
            hasher.update(part);
            data.extend_from_slice(part);
        }

        if self.verify_integrity && hasher.finalize() != file.content_hash {
            return Err(StorageError::IntegrityCheckFailed {
                file_id: file.id,
                order: None,
            });
        }

        Ok(data)
    }

    /// Orders must run 0..n without gaps and the sizes must add up
    fn check_complete(file: &LogicalFile, chunks: &[ChunkRecord]) -> Result<(), StorageError> {
        let contiguous = !chunks.is_empty()
            && chunks
                .iter()
                .enumerate()
                .all(|(i, chunk)| chunk.order as usize == i);
        let found: u64 = chunks.iter().map(|c| c.size).sum();

        if !contiguous || found != file.total_size {
            return Err(StorageError::IncompleteFile {
                file_id: file.id,
                expected: file.total_size,
                found,
            });
        }
        Ok(())
    }

    async fn fetch_chunk(&self, file_id: FileId, chunk: &ChunkRecord) -> Result<Vec<u8>, StorageError> {
        let account = self.account(&chunk.account_id).await?;

        let downloaded = match self.session(&account).await {
            Ok(session) => self.backend.download(&session, &chunk.remote_handle).await,
            Err(err) => Err(err),
        };
        let data = downloaded.map_err(|source| {
            self.forget_session_on(&account.id, &source);
            StorageError::ChunkFetch {
                file_id,
                order: chunk.order,
                account_id: account.id,
                source,
            }
        })?;

        let size_ok = data.len() as u64 == chunk.size;
        if !size_ok || (self.verify_integrity && !chunk.content_hash.verify(&data)) {
            return Err(StorageError::IntegrityCheckFailed {
                file_id,
                order: Some(chunk.order),
            });
        }

        tracing::debug!("Fetched chunk {} of {} from account {}", chunk.order, file_id, account.id);
        Ok(data)
    }

    // ----- delete -----

    /// Delete every chunk of a file, then the file itself.
    ///
    /// A chunk whose backend delete fails keeps its record and its capacity,
    /// and the file record is kept, so the call can simply be repeated.
    /// Chunks already gone from the store are treated as deleted.
    pub async fn delete_file(&self, file: &LogicalFile) -> Result<(), StorageError> {
        let chunks = self.index.chunks_for_file(&file.id).await;
        let mut remaining: Vec<ChunkId> = Vec::new();
        let mut first_failure: Option<(u32, AccountId, BackendError)> = None;

        for chunk in &chunks {
            match self.delete_chunk(chunk).await? {
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(
                        "Delete of chunk {} of {} failed on account {}: {}",
                        chunk.order,
                        file.id,
                        chunk.account_id,
                        err
                    );
                    remaining.push(chunk.id);
                    if first_failure.is_none() {
                        first_failure = Some((chunk.order, chunk.account_id, err));
                    }
                }
            }
        }

        if let Some((order, account_id, source)) = first_failure {
            return Err(StorageError::DeleteIncomplete {
                file_id: file.id,
                remaining,
                order,
                account_id,
                source,
            });
        }

        self.index.remove_file(&file.id).await?;
        tracing::info!("Deleted {} ({} chunk(s))", file.path, chunks.len());
        Ok(())
    }

    /// The outer error is an index failure and aborts the delete; the inner
    /// one is a backend failure that leaves this chunk in place.
    async fn delete_chunk(
        &self,
        chunk: &ChunkRecord,
    ) -> Result<Result<(), BackendError>, StorageError> {
        let account = self.account(&chunk.account_id).await?;

        let deleted = match self.session(&account).await {
            Ok(session) => self.backend.delete(&session, &chunk.remote_handle).await,
            Err(err) => Err(err),
        };
        match deleted {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                tracing::debug!(
                    "Blob {} already gone from account {}",
                    chunk.remote_handle,
                    account.id
                );
            }
            Err(err) => {
                self.forget_session_on(&account.id, &err);
                return Ok(Err(err));
            }
        }

        let released = self
            .ledger
            .release(&account.id, chunk.size, |available| async move {
                self.index.remove_chunk(&chunk.id, available).await.map(|_| ())
            })
            .await;

        match released {
            Ok(_) => Ok(Ok(())),
            // A concurrent delete removed and credited it first
            Err(StorageError::ChunkNotFound(_)) => {
                tracing::debug!("Chunk {} already removed", chunk.id);
                Ok(Ok(()))
            }
            Err(err) => Err(err),
        }
    }
}
