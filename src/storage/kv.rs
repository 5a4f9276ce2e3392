use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::error::StorageError;

/// Flat string key/value namespace. Every store persists one JSON document
/// per key through this seam.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Fails with [`StorageError::QuotaExceeded`] when the write would push
    /// the namespace past its quota.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store with an optional byte quota over `key + value` lengths.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Mutex<Option<u64>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Mutex::new(Some(quota_bytes)),
        }
    }

    /// Write without quota checks.
    pub fn seed(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_quota(&self, quota_bytes: Option<u64>) {
        if let Ok(mut quota) = self.quota_bytes.lock() {
            *quota = quota_bytes;
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries
            .lock()
            .map(|e| e.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum())
            .unwrap_or(0)
    }

    pub fn get_now(&self, key: &str) -> Option<String> {
        self.entries.lock().ok().and_then(|e| e.get(key).cloned())
    }
}

fn poisoned() -> StorageError {
    StorageError::Database("memory store lock poisoned".into())
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let quota = *self.quota_bytes.lock().map_err(|_| poisoned())?;
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;

        if let Some(quota) = quota {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let needed = others + (key.len() + value.len()) as u64;
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
