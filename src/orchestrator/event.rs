use crate::core::error::ErrorKind;
use crate::core::message::TurnSource;
use crate::core::model::ModelId;
use crate::storage::Mode;

/// Progress of one submission, in emission order. Every submission ends
/// with exactly one of `Complete`, `ImageGenerated`, `Aborted`,
/// `ConsentRequired` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Started {
        chat_id: String,
        model: ModelId,
    },
    CacheHit {
        model: ModelId,
    },
    ModelSubstituted {
        from: ModelId,
        to: ModelId,
        mode: Mode,
    },
    FasterModelSuggested {
        current: ModelId,
        suggested: ModelId,
        speedup: f64,
    },
    ContentDelta {
        text: String,
    },
    /// The streamed call failed and a non-streamed call follows; text
    /// already shown from deltas should be discarded.
    StreamFallback {
        model: ModelId,
        reason: String,
    },
    ModelRotated {
        from: ModelId,
        to: ModelId,
    },
    Retrying {
        attempt: u32,
        max: u32,
    },
    ImageGenerated {
        url: String,
        model: ModelId,
        elapsed_secs: f64,
    },
    Complete {
        text: String,
        model: ModelId,
        elapsed_secs: f64,
        source: TurnSource,
    },
    Aborted {
        elapsed_secs: f64,
    },
    ConsentRequired {
        model: ModelId,
        popup_blocked: bool,
        message: String,
        hint: String,
        retry_prompt: String,
    },
    Failed {
        message: String,
        kind: ErrorKind,
        /// Resubmits the prompt as the user originally typed it
        retry_prompt: Option<String>,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. }
                | Self::ImageGenerated { .. }
                | Self::Aborted { .. }
                | Self::ConsentRequired { .. }
                | Self::Failed { .. }
        )
    }
}
