//! Filesystem backing store - one directory per account
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<account-key>/account.json
//! <root>/<account-key>/blobs/<handle[..2]>/<handle>
//! ```
//!
//! `account-key` is derived from the login so arbitrary e-mail addresses
//! never reach the filesystem. The first login of an account provisions its
//! directory and pins the secret fingerprint; later logins must match it.

use super::{AccountIdentity, BackendError, BackingStore, BlobHandle, Session};
use crate::crypto::ContentHash;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct AccountFile {
    login: String,
    secret_fingerprint: String,
    created_at: i64,
}

/// Filesystem-backed [`BackingStore`]
pub struct LocalBackend {
    root: PathBuf,

    /// token -> account key
    sessions: DashMap<String, String>,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    fn account_key(login: &str) -> String {
        ContentHash::hash(login.as_bytes()).to_hex()[..16].to_string()
    }

    fn fingerprint(identity: &AccountIdentity) -> String {
        let mut material = identity.login.as_bytes().to_vec();
        material.push(0);
        material.extend_from_slice(identity.secret.as_bytes());
        ContentHash::hash(&material).to_hex()
    }

    fn account_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Handles are issued by this backend as lowercase hex; anything else
    /// cannot name a stored blob.
    fn blob_path(&self, key: &str, handle: &BlobHandle) -> Option<PathBuf> {
        let h = handle.as_str();
        if h.len() < 3 || !h.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.account_dir(key).join("blobs").join(&h[..2]).join(h))
    }

    fn session_key(&self, session: &Session) -> Result<String, BackendError> {
        self.sessions
            .get(&session.token)
            .map(|key| key.clone())
            .ok_or(BackendError::InvalidSession)
    }

    /// Write to a unique temp file in the target directory, sync it, then
    /// rename it into place so readers never observe a partial file.
    ///
    /// With `overwrite` unset an existing target is left alone and `false`
    /// is returned.
    async fn atomic_write(path: &Path, data: Vec<u8>, overwrite: bool) -> Result<bool, BackendError> {
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<bool, BackendError> {
            let dir = path.parent().ok_or_else(|| {
                BackendError::Unavailable(format!("no parent directory for {}", path.display()))
            })?;
            std::fs::create_dir_all(dir)?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;

            let persisted = if overwrite {
                tmp.persist(&path)
            } else {
                tmp.persist_noclobber(&path)
            };
            match persisted {
                Ok(_) => Ok(true),
                Err(e) if !overwrite && e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    Ok(false)
                }
                Err(e) => Err(e.error.into()),
            }
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("write task failed: {}", e)))?
    }

    async fn read_account(path: &Path) -> Result<Option<AccountFile>, BackendError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                BackendError::Unavailable(format!("corrupt account file: {}", e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the account file, creating it on first login. Concurrent first
    /// logins agree on whichever file landed first.
    async fn load_or_provision(
        &self,
        key: &str,
        identity: &AccountIdentity,
        fingerprint: &str,
    ) -> Result<AccountFile, BackendError> {
        let account_path = self.account_dir(key).join("account.json");
        if let Some(account) = Self::read_account(&account_path).await? {
            return Ok(account);
        }

        let account = AccountFile {
            login: identity.login.clone(),
            secret_fingerprint: fingerprint.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let raw = serde_json::to_vec_pretty(&account)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if Self::atomic_write(&account_path, raw, false).await? {
            tracing::info!("Provisioned local account {} at {}", identity.login, key);
            return Ok(account);
        }

        Self::read_account(&account_path).await?.ok_or_else(|| {
            BackendError::Unavailable(format!("account file for {} vanished", identity.login))
        })
    }
}

#[async_trait]
impl BackingStore for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn login(&self, identity: &AccountIdentity) -> Result<Session, BackendError> {
        let key = Self::account_key(&identity.login);
        let fingerprint = Self::fingerprint(identity);

        let account = self.load_or_provision(&key, identity, &fingerprint).await?;
        if account.secret_fingerprint != fingerprint {
            return Err(BackendError::Auth {
                login: identity.login.clone(),
                reason: "wrong secret".into(),
            });
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(token.clone(), key);
        Ok(Session {
            login: identity.login.clone(),
            token,
        })
    }

    async fn upload(
        &self,
        session: &Session,
        data: &[u8],
        name_hint: &str,
    ) -> Result<BlobHandle, BackendError> {
        let key = self.session_key(session)?;
        let handle = BlobHandle(uuid::Uuid::new_v4().simple().to_string());
        let path = self
            .blob_path(&key, &handle)
            .ok_or_else(|| BackendError::Unavailable("invalid generated handle".into()))?;

        Self::atomic_write(&path, data.to_vec(), true).await?;
        tracing::debug!("Stored {} ({} bytes) as {}", name_hint, data.len(), handle);
        Ok(handle)
    }

    async fn download(
        &self,
        session: &Session,
        handle: &BlobHandle,
    ) -> Result<Vec<u8>, BackendError> {
        let key = self.session_key(session)?;
        let path = self
            .blob_path(&key, handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, session: &Session, handle: &BlobHandle) -> Result<(), BackendError> {
        let key = self.session_key(session)?;
        let path = self
            .blob_path(&key, handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());
        let identity = AccountIdentity::new("a@example.com", "secret");

        let session = backend.login(&identity).await.unwrap();
        let handle = backend.upload(&session, b"chunk data", "f.part0").await.unwrap();

        assert_eq!(
            backend.download(&session, &handle).await.unwrap(),
            b"chunk data".to_vec()
        );

        backend.delete(&session, &handle).await.unwrap();
        assert!(matches!(
            backend.download(&session, &handle).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete(&session, &handle).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_secret_is_pinned_on_first_login() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());

        backend
            .login(&AccountIdentity::new("a@example.com", "secret"))
            .await
            .unwrap();

        let result = backend
            .login(&AccountIdentity::new("a@example.com", "other"))
            .await;
        assert!(matches!(result, Err(BackendError::Auth { .. })));

        // A fresh process over the same root still enforces it
        let reopened = LocalBackend::new(temp_dir.path());
        assert!(reopened
            .login(&AccountIdentity::new("a@example.com", "secret"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejects_foreign_handles() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());
        let session = backend
            .login(&AccountIdentity::new("a@example.com", "secret"))
            .await
            .unwrap();

        let traversal = BlobHandle("../../account.json".into());
        assert!(matches!(
            backend.download(&session, &traversal).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());
        let session = Session {
            login: "a@example.com".into(),
            token: "forged".into(),
        };

        assert!(matches!(
            backend.upload(&session, b"x", "x").await,
            Err(BackendError::InvalidSession)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_logins_agree() {
        let temp_dir = TempDir::new().unwrap();
        let backend = std::sync::Arc::new(LocalBackend::new(temp_dir.path()));

        for round in 0..20 {
            let login = format!("user{}@example.com", round);
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let backend = std::sync::Arc::clone(&backend);
                    let identity = AccountIdentity::new(login.clone(), "secret");
                    tokio::spawn(async move { backend.login(&identity).await })
                })
                .collect();

            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        }

        // No temp files are left next to the account files
        let leftovers = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .flat_map(|dir| std::fs::read_dir(dir.unwrap().path()).unwrap())
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name != "account.json" && name != "blobs"
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_logins_with_different_secrets() {
        let temp_dir = TempDir::new().unwrap();
        let backend = std::sync::Arc::new(LocalBackend::new(temp_dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let backend = std::sync::Arc::clone(&backend);
                let identity = AccountIdentity::new("a@example.com", format!("secret{}", i % 2));
                tokio::spawn(async move { backend.login(&identity).await })
            })
            .collect();

        let mut accepted = std::collections::HashSet::new();
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await.unwrap() {
                Ok(_) => {
                    accepted.insert(i % 2);
                }
                Err(err) => assert!(matches!(err, BackendError::Auth { .. })),
            }
        }

        // Exactly one secret got pinned
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_are_atomic() {
        let temp_dir = TempDir::new().unwrap();
        let backend = std::sync::Arc::new(LocalBackend::new(temp_dir.path()));
        let session = backend
            .login(&AccountIdentity::new("a@example.com", "secret"))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let backend = std::sync::Arc::clone(&backend);
                let session = session.clone();
                tokio::spawn(async move {
                    let payload = vec![i; 64 * 1024];
                    let handle = backend.upload(&session, &payload, "part").await.unwrap();
                    (handle, payload)
                })
            })
            .collect();

        for handle in handles {
            let (blob, payload) = handle.await.unwrap();
            assert_eq!(backend.download(&session, &blob).await.unwrap(), payload);
        }
    }
}
