//! Backing Store Module - the third-party object store behind every account
//!
//! The core never talks to a concrete provider directly. Everything it needs
//! from one is the four calls of [`BackingStore`], each keyed by an account
//! identity (through a [`Session`]) and producing or consuming an opaque
//! [`BlobHandle`].

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Authentication failed for {login}: {reason}")]
    Auth { login: String, reason: String },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Session expired or unknown")]
    InvalidSession,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the cached session for the account should be dropped
    pub fn invalidates_session(&self) -> bool {
        matches!(self, BackendError::Auth { .. } | BackendError::InvalidSession)
    }
}

/// Credentials of one backing account. Opaque to the core.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Login name at the provider (an e-mail address for most providers)
    pub login: String,

    /// Provider secret
    pub secret: String,
}

impl AccountIdentity {
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountIdentity")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated session with the backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Login the session was opened for
    pub login: String,

    /// Provider-issued token
    pub token: String,
}

/// Opaque handle of a blob stored in one account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(pub String);

impl BlobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client interface of the third-party store.
///
/// Implementations are expected to fail transiently; the core never retries a
/// call on its own and reports any failure, including timeouts, as a
/// [`BackendError`].
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Human-readable name of this backend
    fn name(&self) -> &str;

    /// Open a session for an account
    async fn login(&self, identity: &AccountIdentity) -> Result<Session, BackendError>;

    /// Store a blob and return its handle
    async fn upload(
        &self,
        session: &Session,
        data: &[u8],
        name_hint: &str,
    ) -> Result<BlobHandle, BackendError>;

    /// Fetch a blob by handle
    async fn download(&self, session: &Session, handle: &BlobHandle)
        -> Result<Vec<u8>, BackendError>;

    /// Remove a blob by handle
    async fn delete(&self, session: &Session, handle: &BlobHandle) -> Result<(), BackendError>;
}
