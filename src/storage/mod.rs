mod cache;
mod database;
mod history;
mod kv;
mod kv_repo;
mod metrics;
mod prefs;


pub use cache::{cache_key, retain_newest, CacheEntry, ResponseCache, CACHE_STORAGE_KEY};
pub use database::Database;
pub use history::{ChatSummary, HistoryStore, HISTORY_STORAGE_KEY};
pub use kv::{KvStore, MemoryKv};
pub use kv_repo::SqliteKv;
pub use metrics::{
    suggest_faster_model, MetricsStore, MetricsTable, ModelMetrics, Suggestion,
    METRICS_STORAGE_KEY,
};
pub use prefs::{
    Mode, Preferences, CONSENT_DISMISSED_KEY, REQUEST_COUNT_KEY, SPEED_MODE_KEY,
    SPEED_OFF_NOTICE, SPEED_ON_NOTICE, THINKING_MODE_KEY, THINKING_OFF_NOTICE,
    THINKING_ON_NOTICE,
};
