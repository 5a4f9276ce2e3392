use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::config::CacheConfig;
use crate::core::error::StorageError;
use crate::core::model::ModelId;
use crate::storage::kv::KvStore;

pub const CACHE_STORAGE_KEY: &str = "ai_response_cache";

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub response: String,
    /// Creation time, unix milliseconds
    pub timestamp: i64,
}

pub fn cache_key(model: &ModelId, prompt: &str) -> String {
    format!("{model}:{prompt}")
}

/// Prompt+model keyed cache of prior text responses.
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    /// Load the persisted cache, dropping entries past the purge age.
    pub async fn load(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        let mut entries: HashMap<String, CacheEntry> = match kv.get(CACHE_STORAGE_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse response cache, starting empty: {e}");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("Failed to load response cache: {e}");
                HashMap::new()
            }
        };

        let now = Utc::now().timestamp_millis();
        let purge_ms = config.purge_hours as i64 * HOUR_MS;
        let before = entries.len();
        entries.retain(|_, entry| now - entry.timestamp <= purge_ms);
        if entries.len() != before {
            tracing::debug!("Purged {} stale cache entries", before - entries.len());
        }

        Self {
            kv,
            config,
            entries: Mutex::new(entries),
        }
    }

    /// Cached text for `(model, prompt)` if younger than the TTL. Expired
    /// entries are removed when observed.
    pub async fn lookup(&self, model: &ModelId, prompt: &str) -> Option<String> {
        let key = cache_key(model, prompt);
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&key)?;

        let age = Utc::now().timestamp_millis() - entry.timestamp;
        if age < self.config.ttl_hours as i64 * HOUR_MS {
            tracing::debug!(model = %model, "Response cache hit");
            return Some(entry.response.clone());
        }

        entries.remove(&key);
        None
    }

    /// Insert or overwrite an entry. Empty or oversized responses are
    /// ignored. Persistence happens only when the entry count lands on a
    /// multiple of `flush_every`; call [`ResponseCache::flush`] to force it.
    pub async fn store(&self, model: &ModelId, prompt: &str, response: &str) -> bool {
        if response.is_empty() || response.chars().count() > self.config.max_entry_chars {
            return false;
        }

        let mut entries = self.entries.lock().await;
        entries.insert(
            cache_key(model, prompt),
            CacheEntry {
                response: response.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );

        if entries.len() % self.config.flush_every.max(1) == 0 {
            self.persist(&mut entries).await;
        }
        true
    }

    pub async fn flush(&self) {
        let mut entries = self.entries.lock().await;
        self.persist(&mut entries).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        if let Err(e) = self.kv.remove(CACHE_STORAGE_KEY).await {
            tracing::warn!("Failed to clear persisted response cache: {e}");
        }
    }

    async fn write(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), StorageError> {
        let json = serde_json::to_string(entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(CACHE_STORAGE_KEY, &json).await
    }

    /// Write through; on quota failure keep only the newest entries and try
    /// once more, then give up and drop everything.
    async fn persist(&self, entries: &mut HashMap<String, CacheEntry>) {
        let err = match self.write(entries).await {
            Ok(()) => return,
            Err(e) => e,
        };

        if !err.is_quota_exceeded() {
            tracing::warn!("Failed to save response cache: {err}");
            return;
        }

        tracing::warn!(
            "Response cache hit storage quota, keeping newest {}",
            self.config.keep_on_quota
        );
        retain_newest(entries, self.config.keep_on_quota);

        if let Err(e) = self.write(entries).await {
            tracing::warn!("Response cache still over quota, clearing it: {e}");
            entries.clear();
            if let Err(e) = self.kv.remove(CACHE_STORAGE_KEY).await {
                tracing::warn!("Failed to remove persisted response cache: {e}");
            }
        }
    }
}

/// Keep the `keep` entries with the latest creation timestamps.
pub fn retain_newest(entries: &mut HashMap<String, CacheEntry>, keep: usize) {
    if entries.len() <= keep {
        return;
    }
    let mut by_age: Vec<(String, i64)> = entries
        .iter()
        .map(|(k, e)| (k.clone(), e.timestamp))
        .collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in by_age.into_iter().skip(keep) {
        entries.remove(&key);
    }
}
