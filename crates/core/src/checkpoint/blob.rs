use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob key {0:?} is not a valid relative path")]
    InvalidKey(String),
    #[error("blob backend failed: {0}")]
    Backend(String),
}

/// Key-value document storage. Keys are `/`-separated relative paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, BlobError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), BlobError>;
    async fn remove(&self, key: &str) -> Result<(), BlobError>;
}

#[async_trait]
impl<B: BlobStore + ?Sized> BlobStore for Arc<B> {
    async fn load(&self, key: &str) -> Result<Option<String>, BlobError> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), BlobError> {
        (**self).save(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), BlobError> {
        (**self).remove(key).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> Result<T, BlobError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BlobError::Backend("memory blob store poisoned".into()))?;
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, key: &str) -> Result<Option<String>, BlobError> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), BlobError> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    async fn remove(&self, key: &str) -> Result<(), BlobError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }
}
