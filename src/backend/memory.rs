//! In-process backing store with fault injection
//!
//! Keeps every account's blobs in memory. Used by the test suites and by
//! embedders that want to exercise the allocator without a real provider.

use super::{AccountIdentity, BackendError, BackingStore, BlobHandle, Session};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Faults {
    /// Uploads still allowed before every further upload fails
    upload_budget: Option<usize>,

    /// Handles whose delete always fails
    failing_deletes: HashSet<BlobHandle>,

    /// Artificial latency per login for downloads
    download_delays: HashMap<String, Duration>,
}

/// Memory-backed [`BackingStore`]
#[derive(Default)]
pub struct MemoryBackend {
    /// login -> secret
    accounts: DashMap<String, String>,

    /// token -> login
    sessions: DashMap<String, String>,

    /// (login, handle) -> blob
    blobs: DashMap<(String, BlobHandle), Vec<u8>>,

    faults: Mutex<Faults>,

    logins: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an account known to the store
    pub fn register_account(&self, identity: &AccountIdentity) {
        self.accounts
            .insert(identity.login.clone(), identity.secret.clone());
    }

    /// Let `n` more uploads succeed, then fail every upload after them
    pub fn fail_uploads_after(&self, n: usize) {
        self.faults.lock().upload_budget = Some(n);
    }

    /// Make deletes of `handle` fail until faults are cleared
    pub fn fail_delete(&self, handle: &BlobHandle) {
        self.faults.lock().failing_deletes.insert(handle.clone());
    }

    /// Delay every download from `login`
    pub fn delay_downloads(&self, login: &str, delay: Duration) {
        self.faults
            .lock()
            .download_delays
            .insert(login.to_string(), delay);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Drop every open session, forcing clients to log in again
    pub fn expire_sessions(&self) {
        self.sessions.clear();
    }

    /// Overwrite a stored blob in place
    pub fn tamper(&self, login: &str, handle: &BlobHandle, data: Vec<u8>) -> bool {
        match self.blobs.get_mut(&(login.to_string(), handle.clone())) {
            Some(mut blob) => {
                *blob = data;
                true
            }
            None => false,
        }
    }

    /// Remove a blob behind the client's back
    pub fn forget(&self, login: &str, handle: &BlobHandle) -> bool {
        self.blobs
            .remove(&(login.to_string(), handle.clone()))
            .is_some()
    }

    /// Number of blobs stored for `login`
    pub fn blob_count(&self, login: &str) -> usize {
        self.blobs.iter().filter(|e| e.key().0 == login).count()
    }

    /// Number of blobs stored across all accounts
    pub fn total_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Number of successful logins so far
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn session_login(&self, session: &Session) -> Result<String, BackendError> {
        match self.sessions.get(&session.token) {
            Some(login) if *login == session.login => Ok(login.clone()),
            _ => Err(BackendError::InvalidSession),
        }
    }
}

#[async_trait]
impl BackingStore for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn login(&self, identity: &AccountIdentity) -> Result<Session, BackendError> {
        let known = self
            .accounts
            .get(&identity.login)
            .map(|secret| *secret == identity.secret);

        match known {
            Some(true) => {
                let token = uuid::Uuid::new_v4().to_string();
                self.sessions.insert(token.clone(), identity.login.clone());
                self.logins.fetch_add(1, Ordering::SeqCst);
                Ok(Session {
                    login: identity.login.clone(),
                    token,
                })
            }
            Some(false) => Err(BackendError::Auth {
                login: identity.login.clone(),
                reason: "wrong secret".into(),
            }),
            None => Err(BackendError::Auth {
                login: identity.login.clone(),
                reason: "unknown account".into(),
            }),
        }
    }

    async fn upload(
        &self,
        session: &Session,
        data: &[u8],
        name_hint: &str,
    ) -> Result<BlobHandle, BackendError> {
        let login = self.session_login(session)?;

        {
            let mut faults = self.faults.lock();
            if let Some(budget) = faults.upload_budget.as_mut() {
                if *budget == 0 {
                    return Err(BackendError::Unavailable(format!(
                        "upload of {} rejected",
                        name_hint
                    )));
                }
                *budget -= 1;
            }
        }

        let handle = BlobHandle(uuid::Uuid::new_v4().simple().to_string());
        self.blobs.insert((login, handle.clone()), data.to_vec());
        Ok(handle)
    }

    async fn download(
        &self,
        session: &Session,
        handle: &BlobHandle,
    ) -> Result<Vec<u8>, BackendError> {
        let login = self.session_login(session)?;

        let delay = self.faults.lock().download_delays.get(&login).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.blobs
            .get(&(login, handle.clone()))
            .map(|blob| blob.clone())
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))
    }

    async fn delete(&self, session: &Session, handle: &BlobHandle) -> Result<(), BackendError> {
        let login = self.session_login(session)?;

        if self.faults.lock().failing_deletes.contains(handle) {
            return Err(BackendError::Unavailable(format!("delete of {} rejected", handle)));
        }

        self.blobs
            .remove(&(login, handle.clone()))
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))
    }
}
