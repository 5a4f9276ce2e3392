use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::message::{Turn, TurnRole};
use crate::core::model::ModelId;

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_CHARS: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Last time the snapshot was saved
    pub timestamp: DateTime<Utc>,
    pub transcript: Vec<Turn>,
    pub model_id: ModelId,
}

impl ChatSession {
    pub fn new(model_id: ModelId) -> Self {
        let now = Utc::now();
        Self {
            id: generate_chat_id(),
            title: DEFAULT_TITLE.into(),
            created_at: now,
            timestamp: now,
            transcript: Vec::new(),
            model_id,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.transcript.push(turn);
    }

    pub fn has_user_turn(&self) -> bool {
        self.transcript.iter().any(|t| t.role == TurnRole::User)
    }

    pub fn last_user_prompt(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.text.as_str())
    }

    /// Derive the title from the first user turn if it is still the default.
    pub fn refresh_title(&mut self) {
        if self.title != DEFAULT_TITLE {
            return;
        }
        if let Some(first) = self.transcript.iter().find(|t| t.role == TurnRole::User) {
            self.title = title_from(&first.text);
        }
    }

    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

pub fn title_from(text: &str) -> String {
    let mut title: String = text.chars().take(TITLE_CHARS).collect();
    if text.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

/// Millisecond timestamp followed by eight random hex characters.
pub fn generate_chat_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}{}", &random[..8])
}
