use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};

use super::{ObjectStore, StoreError, validate_path};
use crate::platform::{NativePlatform, Platform};

/// Object store backed by a directory tree.
///
/// Writes land in a hidden temp file first and are published with a hard
/// link, which fails atomically when the target already exists. Readers never
/// observe a partially written blob and concurrent writers get `Conflict`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root).await?;
        }
        NativePlatform::restrict_dir_permissions(&root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent).await?;

        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes).await?;

        let published = fs::hard_link(&tmp, &full).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            warn!("Failed to remove temp blob {}: {}", tmp.display(), e);
        }

        match published {
            Ok(()) => {
                debug!("Wrote blob {} ({} bytes)", path, bytes.len());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::Conflict(path.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Only the directory holding the prefix needs to be walked.
        let base = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if base.is_empty() {
            self.root.clone()
        } else {
            self.resolve(base)?
        };
        if !fs::try_exists(&start).await? {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let entry_path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                let Ok(relative) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }
}
