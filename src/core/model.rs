use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        ModelId(s.to_string())
    }
}

/// Model family, derived from the identifier prefix.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Gemini,
    Gpt,
    DallE,
    Claude,
    DeepSeek,
    Other,
}

impl ModelFamily {
    pub fn from_id(id: &str) -> Self {
        if id.starts_with("gemini-") {
            Self::Gemini
        } else if id.starts_with("gpt-") {
            Self::Gpt
        } else if id.starts_with("dall-e") {
            Self::DallE
        } else if id.starts_with("claude-") {
            Self::Claude
        } else if id.starts_with("deepseek-") {
            Self::DeepSeek
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini => write!(f, "Google Gemini"),
            Self::Gpt => write!(f, "OpenAI GPT"),
            Self::DallE => write!(f, "OpenAI DALL-E"),
            Self::Claude => write!(f, "Anthropic Claude"),
            Self::DeepSeek => write!(f, "DeepSeek"),
            Self::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_vision: bool,
    pub supports_image_generation: bool,
    pub supports_streaming: bool,
}

/// A user-facing capability label shown in model info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityLabel {
    TextGeneration,
    ImageAnalysis,
    ImageGeneration,
    AdvancedReasoning,
    DetailedResponses,
    ProblemSolving,
}

impl fmt::Display for CapabilityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextGeneration => write!(f, "Text Generation"),
            Self::ImageAnalysis => write!(f, "Image Analysis"),
            Self::ImageGeneration => write!(f, "Image Generation"),
            Self::AdvancedReasoning => write!(f, "Advanced Reasoning"),
            Self::DetailedResponses => write!(f, "Detailed Responses"),
            Self::ProblemSolving => write!(f, "Problem Solving"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub family: ModelFamily,
    pub display_name: String,
    pub capabilities: ModelCapabilities,
}

impl Model {
    fn new(id: &str, display_name: &str, vision: bool, image_generation: bool) -> Self {
        Self {
            id: ModelId::from(id),
            family: ModelFamily::from_id(id),
            display_name: display_name.into(),
            capabilities: ModelCapabilities {
                supports_vision: vision,
                supports_image_generation: image_generation,
                supports_streaming: !image_generation,
            },
        }
    }

    /// Vision and image-generation models are never picked by automatic
    /// substitution (mode overrides, metrics suggestions, retry rotation).
    pub fn is_specialized(&self) -> bool {
        self.capabilities.supports_vision || self.capabilities.supports_image_generation
    }

    pub fn capability_labels(&self) -> Vec<CapabilityLabel> {
        if self.capabilities.supports_image_generation {
            return vec![CapabilityLabel::ImageGeneration];
        }
        let mut labels = vec![CapabilityLabel::TextGeneration];
        if self.capabilities.supports_vision {
            labels.push(CapabilityLabel::ImageAnalysis);
        }
        if self.id.0.contains("claude-3-opus") {
            labels.push(CapabilityLabel::AdvancedReasoning);
            labels.push(CapabilityLabel::DetailedResponses);
        }
        if self.id.0 == "deepseek-reasoner" {
            labels.push(CapabilityLabel::ProblemSolving);
        }
        labels
    }
}

/// The fixed, ordered model catalog. Order is the fallback rotation order
/// and the tie-break order for metrics ranking.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<Model>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    pub fn builtin() -> Self {
        Self {
            models: vec![
                Model::new("gemini-2.0-flash", "Gemini 2.0 Flash", false, false),
                Model::new("gemini-1.5-flash", "Gemini 1.5 Flash", false, false),
                Model::new("gpt-4o", "GPT-4o", false, false),
                Model::new("gpt-4o-vision", "GPT-4o Vision", true, false),
                Model::new("dall-e-3", "DALL-E 3", false, true),
                Model::new("claude-3-5-sonnet", "Claude 3-5-sonnet", false, false),
                Model::new("claude-3-opus", "Claude 3-opus", false, false),
                Model::new("claude-3-sonnet", "Claude 3-sonnet", false, false),
                Model::new("claude-3-haiku", "Claude 3-haiku", false, false),
                Model::new("deepseek-chat", "DeepSeek Chat", false, false),
                Model::new("deepseek-reasoner", "DeepSeek Reasoner", false, false),
            ],
        }
    }

    pub fn from_models(models: Vec<Model>) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn get(&self, id: &ModelId) -> Option<&Model> {
        self.models.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: &ModelId) -> Option<usize> {
        self.models.iter().position(|m| &m.id == id)
    }

    pub fn first(&self) -> Option<&Model> {
        self.models.first()
    }

    pub fn is_specialized(&self, id: &ModelId) -> bool {
        self.get(id).map_or(false, Model::is_specialized)
    }

    pub fn supports_vision(&self, id: &ModelId) -> bool {
        self.get(id).map_or(false, |m| m.capabilities.supports_vision)
    }

    pub fn supports_image_generation(&self, id: &ModelId) -> bool {
        self.get(id)
            .map_or(false, |m| m.capabilities.supports_image_generation)
    }

    /// Display name, falling back to the raw identifier for unknown models.
    pub fn display_name(&self, id: &ModelId) -> String {
        self.get(id)
            .map(|m| m.display_name.clone())
            .unwrap_or_else(|| id.0.clone())
    }

    /// Next general-purpose model after `current` in catalog order, wrapping
    /// around. Specialized models are skipped. Unknown models rotate to the
    /// first general-purpose entry.
    pub fn next_after(&self, current: &ModelId) -> Option<&Model> {
        let len = self.models.len();
        if len == 0 {
            return None;
        }
        let start = self.position(current).map(|i| i + 1).unwrap_or(0);
        (0..len)
            .map(|offset| &self.models[(start + offset) % len])
            .find(|m| !m.is_specialized() && &m.id != current)
    }
}

/// Rough speed score for the model list: 1s average scores 90, 10s+ scores 0.
pub fn performance_score(avg_response_secs: f64) -> f64 {
    (100.0 - avg_response_secs * 10.0).max(0.0)
}
