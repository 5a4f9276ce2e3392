use crate::core::model::ModelId;
use crate::core::session::ChatSession;

/// Stand-in for the host's consent popup detection.
pub trait ConsentProbe: Send + Sync {
    fn popup_blocked(&self) -> bool;

    /// Remediation text for the current environment.
    fn hint(&self) -> String;
}

/// Terminal hosts never block popups; consent is granted out of band.
pub struct TerminalConsentProbe;

impl ConsentProbe for TerminalConsentProbe {
    fn popup_blocked(&self) -> bool {
        false
    }

    fn hint(&self) -> String {
        "Accept the provider's consent or permission prompt for your account in a browser, then use /retry."
            .into()
    }
}

/// Mutable per-front-end state owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub session: ChatSession,
    pub selected_model: ModelId,
    /// Once set, attempts try the non-streamed call first
    pub consent_error_seen: bool,
    /// Image URL sent with the next vision request
    pub attachment: Option<String>,
    pub last_failed_prompt: Option<String>,
}

impl AppContext {
    pub fn new(selected_model: ModelId) -> Self {
        Self {
            session: ChatSession::new(selected_model.clone()),
            selected_model,
            consent_error_seen: false,
            attachment: None,
            last_failed_prompt: None,
        }
    }

    /// Start a fresh chat, keeping the model selection and consent state.
    pub fn reset_session(&mut self) {
        self.session = ChatSession::new(self.selected_model.clone());
        self.attachment = None;
        self.last_failed_prompt = None;
    }
}

/// Per-submission retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub original_prompt: String,
    pub current_model: ModelId,
    /// Regenerate skips the cache so the model answers afresh
    pub use_cache: bool,
}

impl RetryState {
    pub fn new(original_prompt: String, current_model: ModelId) -> Self {
        Self {
            attempt: 0,
            original_prompt,
            current_model,
            use_cache: true,
        }
    }
}
