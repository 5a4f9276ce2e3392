use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::core::error::ProviderError;
use crate::core::model::ModelId;
use crate::core::provider::*;

/// Client for an OpenAI-compatible gateway.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// POST `body` to `path`, aborting if `cancel` fires first. Non-2xx
    /// responses become [`ProviderError::Api`].
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let send = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r.map_err(|e| ProviderError::Http(e.to_string()))?,
        };

        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status,
            message: extract_error_message(&text),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ProviderError> {
        let body = build_chat_body(request);
        tracing::debug!(
            model = %request.options.model,
            stream = request.options.stream,
            "Sending chat completion"
        );
        let resp = self.post("/v1/chat/completions", &body, &cancel).await?;

        if !request.options.stream {
            let json: serde_json::Value = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                j = resp.json() => j.map_err(|e| ProviderError::Http(e.to_string()))?,
            };
            return Ok(ChatReply::Message(parse_chat_completion(&json)));
        }

        let byte_stream = resp.bytes_stream();
        let stream = async_stream::stream! {
            use tokio_stream::StreamExt;

            let mut byte_stream = Box::pin(byte_stream);
            let mut lines = SseLineBuffer::default();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    c = byte_stream.next() => Ok(c),
                };
                let chunk = match next {
                    Ok(Some(Ok(c))) => c,
                    Ok(Some(Err(e))) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let mut done = false;
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseLine::Fragment(text) => yield Ok(Fragment::text(text)),
                        SseLine::Error(message) => {
                            yield Err(ProviderError::Stream(message));
                            done = true;
                            break;
                        }
                        SseLine::Done => {
                            done = true;
                            break;
                        }
                        SseLine::Skip => {}
                    }
                }
                if done {
                    break;
                }
            }
        };

        Ok(ChatReply::Stream(Box::pin(stream)))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: &ModelId,
        cancel: CancellationToken,
    ) -> Result<ImageResource, ProviderError> {
        let body = serde_json::json!({
            "model": model.0,
            "prompt": prompt,
            "n": 1,
        });
        tracing::debug!(model = %model, "Requesting image generation");
        let resp = self.post("/v1/images/generations", &body, &cancel).await?;

        let json: serde_json::Value = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            j = resp.json() => j.map_err(|e| ProviderError::Http(e.to_string()))?,
        };
        parse_image_response(&json)
    }
}

/// Request body for `/v1/chat/completions`. An attached image turns the
/// user content into a text + image_url part list.
pub fn build_chat_body(request: &ChatRequest) -> serde_json::Value {
    let content = match &request.image_url {
        Some(url) => serde_json::json!([
            {"type": "text", "text": request.prompt},
            {"type": "image_url", "image_url": {"url": url}},
        ]),
        None => serde_json::Value::String(request.prompt.clone()),
    };

    let opts = &request.options;
    let mut body = serde_json::json!({
        "model": opts.model.0,
        "messages": [{"role": "user", "content": content}],
        "stream": opts.stream,
    });
    if let Some(t) = opts.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(m) = opts.max_tokens {
        body["max_tokens"] = serde_json::json!(m);
    }
    if let Some(p) = opts.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    body
}

/// Splits an SSE byte stream into lines. Bytes are held until a newline
/// arrives, so a multi-byte character split across chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Append a chunk and return every line it completed, trimmed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            match std::str::from_utf8(&raw) {
                Ok(line) => lines.push(line.trim().to_string()),
                Err(e) => tracing::warn!("Dropping SSE line with invalid UTF-8: {e}"),
            }
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
pub enum SseLine {
    Fragment(String),
    Error(String),
    Done,
    Skip,
}

/// Classify one line of a chat-completions SSE body.
pub fn parse_sse_line(line: &str) -> SseLine {
    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim(),
        None => return SseLine::Skip,
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(j) => j,
        Err(_) => return SseLine::Skip,
    };
    if let Some(message) = json["error"]["message"].as_str() {
        return SseLine::Error(message.to_string());
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Fragment(text.to_string()),
        _ => SseLine::Skip,
    }
}

/// Map `choices[0].message.content` onto a [`ProviderMessage`]. Missing
/// fields produce an empty message; the caller decides whether that is an
/// invalid shape.
pub fn parse_chat_completion(json: &serde_json::Value) -> ProviderMessage {
    let content = &json["choices"][0]["message"]["content"];
    if let Some(text) = content.as_str() {
        return ProviderMessage::from_text(text);
    }
    // Some gateways return content as a list of typed parts
    let blocks = content
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .map(|p| ContentBlock {
                    text: p["text"].as_str().map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();
    ProviderMessage { content: blocks }
}

pub fn parse_image_response(json: &serde_json::Value) -> Result<ImageResource, ProviderError> {
    let item = &json["data"][0];
    if let Some(url) = item["url"].as_str() {
        return Ok(ImageResource {
            url: url.to_string(),
        });
    }
    if let Some(b64) = item["b64_json"].as_str() {
        return Ok(ImageResource {
            url: format!("data:image/png;base64,{b64}"),
        });
    }
    Err(ProviderError::Stream("No image in response".into()))
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|j| j["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
