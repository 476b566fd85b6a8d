//! PoolDrive Core - Chunked file storage over pooled backing accounts
//!
//! This crate lets a user store files across a private pool of third-party
//! storage accounts that each have a small, finite quota. Files are split
//! into chunks, each chunk is placed on the first account with room for it,
//! and downloads stitch the chunks back together in order.

pub mod backend;
pub mod crypto;
pub mod drive;
pub mod storage;

pub use drive::{AccountSpec, AccountUsage, PoolDrive, UsageReport};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for PoolDrive operations
#[derive(Error, Debug)]
pub enum PoolDriveError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolDriveError>;

/// Core configuration for a PoolDrive instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDriveConfig {
    /// Largest chunk placed on a single account (in bytes)
    pub max_chunk_size: u64,

    /// Quota of an account registered without an explicit capacity (in bytes)
    pub default_account_capacity: u64,

    /// Directory holding the file index; `None` keeps it in memory
    pub data_path: Option<PathBuf>,

    /// Chunk fetches in flight per download
    pub download_concurrency: usize,

    /// Plan/reserve rounds before a lost race is reported as NoCapacity
    pub reservation_attempts: u32,

    /// Verify chunk and file hashes on download
    pub verify_integrity: bool,
}

impl Default for PoolDriveConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 5 * 1024 * 1024 * 1024,            // 5 GB
            default_account_capacity: 20 * 1024 * 1024 * 1024, // 20 GB
            data_path: None,
            download_concurrency: 4,
            reservation_attempts: 3,
            verify_integrity: true,
        }
    }
}

impl PoolDriveConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| PoolDriveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(PoolDriveError::Config("max_chunk_size must be positive".into()));
        }
        if self.download_concurrency == 0 {
            return Err(PoolDriveError::Config(
                "download_concurrency must be positive".into(),
            ));
        }
        if self.reservation_attempts == 0 {
            return Err(PoolDriveError::Config(
                "reservation_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `pooldrive_core=info`. Calling it again, or after another
/// subscriber was installed, does nothing.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pooldrive_core=info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
