//! Integrity Module - content hashing for chunks and files

mod hashing;

pub use hashing::{ContentHash, HashError, IncrementalHasher};
