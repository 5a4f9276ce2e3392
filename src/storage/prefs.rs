use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::StorageError;
use crate::storage::kv::KvStore;

pub const SPEED_MODE_KEY: &str = "performance_mode";
pub const THINKING_MODE_KEY: &str = "thinking_mode";
pub const REQUEST_COUNT_KEY: &str = "ai_request_count";
pub const CONSENT_DISMISSED_KEY: &str = "consent_dismissed";

/// The active response policy. Speed and thinking are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Speed,
    Thinking,
}

impl Mode {
    pub fn is_speed(self) -> bool {
        self == Self::Speed
    }

    pub fn is_thinking(self) -> bool {
        self == Self::Thinking
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Speed => write!(f, "speed"),
            Self::Thinking => write!(f, "thinking"),
        }
    }
}

pub const SPEED_ON_NOTICE: &str = "Speed mode enabled. Responses will prioritize speed over detail.";
pub const SPEED_OFF_NOTICE: &str =
    "Speed mode disabled. Responses will return to normal detail level.";
pub const THINKING_ON_NOTICE: &str = "Thinking & Reasoning mode enabled. Responses will include deeper analysis, step-by-step reasoning, and detailed explanations. Note that responses may take longer but will be more thorough.";
pub const THINKING_OFF_NOTICE: &str =
    "Thinking & Reasoning mode disabled. Responses will return to normal detail level.";

#[derive(Debug, Default)]
struct PrefState {
    mode: Mode,
    request_count: u64,
    consent_dismissed: bool,
}

/// Mode toggles, the request counter and the consent-dismissed flag.
pub struct Preferences {
    kv: Arc<dyn KvStore>,
    state: Mutex<PrefState>,
}

async fn read_flag(kv: &dyn KvStore, key: &str) -> bool {
    match kv.get(key).await {
        Ok(value) => value.as_deref() == Some("true"),
        Err(e) => {
            tracing::warn!("Failed to read preference {key}: {e}");
            false
        }
    }
}

impl Preferences {
    pub async fn load(kv: Arc<dyn KvStore>) -> Self {
        let speed = read_flag(kv.as_ref(), SPEED_MODE_KEY).await;
        let thinking = read_flag(kv.as_ref(), THINKING_MODE_KEY).await;
        let consent_dismissed = read_flag(kv.as_ref(), CONSENT_DISMISSED_KEY).await;
        let request_count = match kv.get(REQUEST_COUNT_KEY).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!("Failed to read request counter: {e}");
                0
            }
        };

        // Both flags set can only come from a hand-edited store; speed wins.
        let mode = match (speed, thinking) {
            (true, _) => Mode::Speed,
            (false, true) => Mode::Thinking,
            _ => Mode::Normal,
        };

        Self {
            kv,
            state: Mutex::new(PrefState {
                mode,
                request_count,
                consent_dismissed,
            }),
        }
    }

    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    /// Enable or disable speed mode. Enabling it turns thinking mode off.
    /// Returns the notice to show the user.
    pub async fn set_speed(&self, enabled: bool) -> Result<&'static str, StorageError> {
        let mut state = self.state.lock().await;
        state.mode = match (enabled, state.mode) {
            (true, _) => Mode::Speed,
            (false, Mode::Speed) => Mode::Normal,
            (false, other) => other,
        };
        self.persist_mode(state.mode).await?;
        tracing::info!(mode = %state.mode, "Mode changed");
        Ok(if enabled { SPEED_ON_NOTICE } else { SPEED_OFF_NOTICE })
    }

    /// Enable or disable thinking mode. Enabling it turns speed mode off.
    pub async fn set_thinking(&self, enabled: bool) -> Result<&'static str, StorageError> {
        let mut state = self.state.lock().await;
        state.mode = match (enabled, state.mode) {
            (true, _) => Mode::Thinking,
            (false, Mode::Thinking) => Mode::Normal,
            (false, other) => other,
        };
        self.persist_mode(state.mode).await?;
        tracing::info!(mode = %state.mode, "Mode changed");
        Ok(if enabled {
            THINKING_ON_NOTICE
        } else {
            THINKING_OFF_NOTICE
        })
    }

    pub async fn toggle_speed(&self) -> Result<&'static str, StorageError> {
        let enabled = !self.mode().await.is_speed();
        self.set_speed(enabled).await
    }

    pub async fn toggle_thinking(&self) -> Result<&'static str, StorageError> {
        let enabled = !self.mode().await.is_thinking();
        self.set_thinking(enabled).await
    }

    async fn persist_mode(&self, mode: Mode) -> Result<(), StorageError> {
        self.kv
            .set(SPEED_MODE_KEY, &mode.is_speed().to_string())
            .await?;
        self.kv
            .set(THINKING_MODE_KEY, &mode.is_thinking().to_string())
            .await
    }

    /// Bump the persisted request counter. Storage failures are logged and
    /// the in-memory count still advances.
    pub async fn increment_requests(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.request_count += 1;
        if let Err(e) = self
            .kv
            .set(REQUEST_COUNT_KEY, &state.request_count.to_string())
            .await
        {
            tracing::warn!("Failed to save request counter: {e}");
        }
        state.request_count
    }

    pub async fn request_count(&self) -> u64 {
        self.state.lock().await.request_count
    }

    pub async fn consent_dismissed(&self) -> bool {
        self.state.lock().await.consent_dismissed
    }

    pub async fn dismiss_consent(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.consent_dismissed = true;
        self.kv.set(CONSENT_DISMISSED_KEY, "true").await
    }
}
