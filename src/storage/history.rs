use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::StorageError;
use crate::core::session::ChatSession;
use crate::storage::kv::KvStore;

pub const HISTORY_STORAGE_KEY: &str = "chat_history";

/// Listing row for the history panel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub turns: usize,
}

/// Whole-snapshot chat persistence keyed by chat id. Last writer wins.
pub struct HistoryStore {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, ChatSession>, StorageError> {
        match self.kv.get(HISTORY_STORAGE_KEY).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn write_all(&self, sessions: &HashMap<String, ChatSession>) -> Result<(), StorageError> {
        let json = serde_json::to_string(sessions)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(HISTORY_STORAGE_KEY, &json).await
    }

    /// Upsert the snapshot. Chats without a user turn are skipped and
    /// `Ok(false)` is returned.
    pub async fn save(&self, session: &ChatSession) -> Result<bool, StorageError> {
        if !session.has_user_turn() {
            return Ok(false);
        }
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        sessions.insert(session.id.clone(), session.clone());
        self.write_all(&sessions).await?;
        tracing::debug!(chat_id = %session.id, "Saved chat snapshot");
        Ok(true)
    }

    pub async fn load(&self, id: &str) -> Result<Option<ChatSession>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(id))
    }

    /// Fails with [`StorageError::NotFound`] for an unknown id.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        if sessions.remove(id).is_none() {
            return Err(StorageError::NotFound(format!("chat {id}")));
        }
        self.write_all(&sessions).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.kv.remove(HISTORY_STORAGE_KEY).await
    }

    /// Saved chats, most recently saved first.
    pub async fn list(&self) -> Result<Vec<ChatSummary>, StorageError> {
        let _guard = self.lock.lock().await;
        let mut rows: Vec<ChatSummary> = self
            .read_all()
            .await?
            .into_values()
            .map(|s| ChatSummary {
                turns: s.transcript.len(),
                id: s.id,
                title: s.title,
                timestamp: s.timestamp,
            })
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(rows)
    }
}
