mod openai;


pub use openai::{
    build_chat_body, parse_chat_completion, parse_image_response, parse_sse_line, OpenAiProvider,
    SseLine, SseLineBuffer,
};

use crate::core::config::AppConfig;
use crate::core::error::ProviderError;
use crate::core::provider::Provider;
use std::sync::Arc;

/// Create the provider for the configured OpenAI-compatible gateway.
/// Every catalog model is served through the same endpoint.
pub fn create_provider(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config
        .get_api_key()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            ProviderError::MissingApiKey(
                "set CHATLINE_API_KEY or OPENAI_API_KEY, or api_key in chatline.json".into(),
            )
        })?;

    Ok(Arc::new(OpenAiProvider::new(
        api_key.to_string(),
        config.base_url.clone(),
    )))
}
