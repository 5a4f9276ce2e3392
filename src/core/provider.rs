use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::core::error::ProviderError;
use crate::core::model::ModelId;

/// Request options understood by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub model: ModelId,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl RequestOptions {
    pub fn new(model: ModelId, stream: bool) -> Self {
        Self {
            model,
            stream,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    pub fn with_stream(&self, stream: bool) -> Self {
        Self {
            stream,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    /// Attached image for vision-capable models
    pub image_url: Option<String>,
    pub options: RequestOptions,
}

/// One block of a non-streamed reply. `text` is optional because upstream
/// payloads are not trusted to carry it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl ProviderMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock {
                text: Some(text.into()),
            }],
        }
    }

    /// `content[0].text`, if present.
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().and_then(|b| b.text.as_deref())
    }
}

/// A streamed text fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub text: Option<String>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

pub type FragmentStream =
    Pin<Box<dyn futures_core::Stream<Item = Result<Fragment, ProviderError>> + Send>>;

pub enum ChatReply {
    Message(ProviderMessage),
    Stream(FragmentStream),
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    pub url: String,
}

/// The hosted AI service. Cancelling `cancel` must abort the underlying
/// request or stream.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ProviderError>;

    async fn generate_image(
        &self,
        prompt: &str,
        model: &ModelId,
        cancel: CancellationToken,
    ) -> Result<ImageResource, ProviderError>;
}
