//! Blob storage addressed by slash-separated paths.
//!
//! `put` is create-only: a second writer for the same path gets
//! [`StoreError::Conflict`], which the ingestion pipeline treats as success.

mod fs;
#[cfg(test)]
mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use fs::FsObjectStore;
#[cfg(test)]
pub use memory::MemoryObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob already exists: {0}")]
    Conflict(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError>;

    /// Every stored path starting with `prefix`, sorted.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Reject paths that could escape the store root or that name a directory.
pub(crate) fn validate_path(path: &str) -> Result<(), StoreError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}
