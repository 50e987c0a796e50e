use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ObjectStore, StoreError, validate_path};

/// In-process store used by tests. Counts successful writes so idempotence
/// can be asserted directly.
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
    put_log: Mutex<Vec<String>>,
    fail_prefix: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Paths of successful writes, oldest first.
    pub fn put_log(&self) -> Vec<String> {
        self.put_log.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn blob(&self, path: &str) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(path.to_string(), Bytes::copy_from_slice(bytes));
    }

    /// Make every `put` under `prefix` fail with an I/O error.
    pub fn fail_puts_under(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.lock().unwrap().contains_key(path))
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StoreError> {
        validate_path(path)?;
        if let Some(prefix) = self.fail_prefix.lock().unwrap().as_deref()
            && path.starts_with(prefix)
        {
            return Err(StoreError::Io(std::io::Error::other("injected failure")));
        }

        let mut blobs = self.blobs.lock().unwrap();
        if blobs.contains_key(path) {
            return Err(StoreError::Conflict(path.to_string()));
        }
        blobs.insert(path.to_string(), bytes);
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.put_log.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blobs.lock().unwrap().get(path).cloned())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
