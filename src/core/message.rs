use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::model::ModelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

/// Where the assistant text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Stream,
    Batch,
    Cache,
    Vision,
    Image,
}

/// One rendered entry of a chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<ModelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TurnSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            model_id: None,
            source: None,
            elapsed_secs: None,
            is_error: false,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        text: impl Into<String>,
        model_id: ModelId,
        source: TurnSource,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            model_id: Some(model_id),
            source: Some(source),
            elapsed_secs: Some(elapsed_secs),
            is_error: false,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: TurnRole::System,
            text: text.into(),
            model_id: None,
            source: None,
            elapsed_secs: None,
            is_error,
            created_at: Utc::now(),
        }
    }
}
