use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::core::error::StorageError;
use crate::core::model::{ModelCatalog, ModelId};
use crate::storage::kv::KvStore;

pub const METRICS_STORAGE_KEY: &str = "ai_model_metrics";

/// Suggestions only apply when the current model averages at least this.
pub const SLOW_MODEL_SECS: f64 = 5.0;
/// Candidates need this many recorded samples.
pub const MIN_SAMPLES: u32 = 3;
/// Candidate average must be at most this fraction of the current average.
pub const CANDIDATE_RATIO: f64 = 0.7;
/// Suggestions are only surfaced above this speedup.
pub const MIN_SPEEDUP: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetrics {
    pub avg_response_time: f64,
    pub response_count: u32,
    pub last_response_time: f64,
}

impl ModelMetrics {
    fn first(sample: f64) -> Self {
        Self {
            avg_response_time: sample,
            response_count: 1,
            last_response_time: sample,
        }
    }

    /// Running average: `avg' = (avg * (n - 1) + sample) / n`.
    fn add_sample(&mut self, sample: f64) {
        self.last_response_time = sample;
        self.response_count += 1;
        let n = self.response_count as f64;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + sample) / n;
    }
}

pub type MetricsTable = HashMap<ModelId, ModelMetrics>;

const UPDATE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub model: ModelId,
    pub speedup: f64,
}

/// Per-model rolling response-time averages.
pub struct MetricsStore {
    kv: Arc<dyn KvStore>,
    table: Mutex<MetricsTable>,
    updates: broadcast::Sender<MetricsTable>,
}

impl MetricsStore {
    pub async fn load(kv: Arc<dyn KvStore>) -> Self {
        let table: MetricsTable = match kv.get(METRICS_STORAGE_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse model metrics, starting empty: {e}");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("Failed to load model metrics: {e}");
                HashMap::new()
            }
        };
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            kv,
            table: Mutex::new(table),
            updates,
        }
    }

    /// Fold a sample into the model's average, persist immediately and
    /// notify subscribers.
    pub async fn record(&self, model: &ModelId, elapsed_secs: f64) -> ModelMetrics {
        let mut table = self.table.lock().await;
        let metrics = table
            .entry(model.clone())
            .and_modify(|m| m.add_sample(elapsed_secs))
            .or_insert_with(|| ModelMetrics::first(elapsed_secs))
            .clone();

        if let Err(e) = self.persist(&table).await {
            tracing::warn!("Failed to save model metrics: {e}");
        }
        // No subscribers is fine
        let _ = self.updates.send(table.clone());
        metrics
    }

    pub async fn get(&self, model: &ModelId) -> Option<ModelMetrics> {
        self.table.lock().await.get(model).cloned()
    }

    pub async fn snapshot(&self) -> MetricsTable {
        self.table.lock().await.clone()
    }

    /// Receives the full table after every [`MetricsStore::record`].
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsTable> {
        self.updates.subscribe()
    }

    pub async fn suggest_faster_model(
        &self,
        current: &ModelId,
        catalog: &ModelCatalog,
    ) -> Option<Suggestion> {
        let table = self.table.lock().await;
        suggest_faster_model(&table, current, catalog)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let mut table = self.table.lock().await;
        table.clear();
        self.kv.remove(METRICS_STORAGE_KEY).await?;
        let _ = self.updates.send(HashMap::new());
        Ok(())
    }

    async fn persist(&self, table: &MetricsTable) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(table).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(METRICS_STORAGE_KEY, &json).await
    }
}

/// A markedly faster general-purpose model than `current`, if the recorded
/// metrics justify one. Ties resolve to the earlier catalog entry.
pub fn suggest_faster_model(
    table: &MetricsTable,
    current: &ModelId,
    catalog: &ModelCatalog,
) -> Option<Suggestion> {
    if catalog.is_specialized(current) {
        return None;
    }
    let current_avg = table.get(current)?.avg_response_time;
    if current_avg < SLOW_MODEL_SECS {
        return None;
    }

    let best = catalog
        .models()
        .iter()
        .filter(|m| !m.is_specialized() && &m.id != current)
        .filter_map(|m| table.get(&m.id).map(|metrics| (&m.id, metrics)))
        .filter(|(_, m)| {
            m.response_count >= MIN_SAMPLES && m.avg_response_time <= current_avg * CANDIDATE_RATIO
        })
        .fold(None::<(&ModelId, f64)>, |best, (id, m)| match best {
            Some((_, best_avg)) if best_avg <= m.avg_response_time => best,
            _ => Some((id, m.avg_response_time)),
        })?;

    let (model, avg) = best;
    if avg <= 0.0 {
        return None;
    }
    // Compared at one decimal, the precision it is shown at
    let speedup = (current_avg / avg * 10.0).round() / 10.0;
    (speedup > MIN_SPEEDUP).then(|| Suggestion {
        model: model.clone(),
        speedup,
    })
}
