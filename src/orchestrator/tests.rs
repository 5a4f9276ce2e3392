use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::core::config::AppConfig;
use crate::core::error::{ChatError, ErrorKind, ProviderError};
use crate::core::message::{TurnRole, TurnSource};
use crate::core::model::{ModelCatalog, ModelId};
use crate::core::provider::*;
use crate::storage::*;

// ---- Scripted provider ----

enum Script {
    Stream(Vec<&'static str>),
    /// Yields the fragments, then never finishes
    Stall(Vec<&'static str>),
    Message(&'static str),
    /// A message whose first block carries no text field
    NoText,
    Fail(ProviderError),
    /// Pending until the call's token is cancelled
    Hang,
}

#[derive(Default)]
struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    images: Mutex<VecDeque<Result<ImageResource, ProviderError>>>,
    calls: Mutex<Vec<ChatRequest>>,
    tokens: Mutex<Vec<CancellationToken>>,
    image_calls: Mutex<Vec<(String, ModelId)>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn push(&self, step: Script) {
        self.script.lock().unwrap().push_back(step);
    }

    fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn fragments(texts: Vec<&'static str>) -> Vec<Result<Fragment, ProviderError>> {
    texts.into_iter().map(|t| Ok(Fragment::text(t))).collect()
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        self.tokens.lock().unwrap().push(cancel.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Fail(ProviderError::Http("script exhausted".into())));

        match step {
            Script::Stream(texts) => Ok(ChatReply::Stream(Box::pin(tokio_stream::iter(
                fragments(texts),
            )))),
            Script::Stall(texts) => Ok(ChatReply::Stream(Box::pin(
                tokio_stream::iter(fragments(texts)).chain(tokio_stream::pending()),
            ))),
            Script::Message(text) => Ok(ChatReply::Message(ProviderMessage::from_text(text))),
            Script::NoText => Ok(ChatReply::Message(ProviderMessage {
                content: vec![ContentBlock { text: None }],
            })),
            Script::Fail(e) => Err(e),
            Script::Hang => {
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
        }
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: &ModelId,
        _cancel: CancellationToken,
    ) -> Result<ImageResource, ProviderError> {
        self.image_calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), model.clone()));
        self.images
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProviderError::Http("no image scripted".into())))
    }
}

// ---- Harness ----

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.timeouts.request_secs = 0.2;
    config.timeouts.image_secs = 0.2;
    config.retry.delay_ms = 5;
    config
}

fn model(id: &str) -> ModelId {
    ModelId::from(id)
}

fn http_error() -> Script {
    Script::Fail(ProviderError::Http("connection reset".into()))
}

fn consent_error() -> Script {
    Script::Fail(ProviderError::Api {
        status: 403,
        message: "User consent required before use".into(),
    })
}

struct Harness {
    orch: Orchestrator,
    provider: Arc<ScriptedProvider>,
    kv: Arc<MemoryKv>,
}

async fn harness_with(script: Vec<Script>, config: AppConfig, kv: Arc<MemoryKv>) -> Harness {
    let provider = Arc::new(ScriptedProvider::new(script));
    let orch = Orchestrator::load(
        provider.clone(),
        kv.clone(),
        config,
        Arc::new(TerminalConsentProbe),
    )
    .await;
    Harness { orch, provider, kv }
}

async fn harness(script: Vec<Script>) -> Harness {
    harness_with(script, test_config(), Arc::new(MemoryKv::new())).await
}

async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

async fn send(orch: &Orchestrator, prompt: &str) -> Vec<ChatEvent> {
    let (rx, _cancel) = orch.submit(prompt).await.unwrap();
    drain(rx).await
}

fn rotations(events: &[ChatEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ModelRotated { .. }))
        .count()
}

fn retries(events: &[ChatEvent]) -> Vec<(u32, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Retrying { attempt, max } => Some((*attempt, *max)),
            _ => None,
        })
        .collect()
}

fn completed_text(events: &[ChatEvent]) -> Option<&str> {
    events.iter().find_map(|e| match e {
        ChatEvent::Complete { text, .. } => Some(text.as_str()),
        _ => None,
    })
}

// ---- Send pipeline ----

#[tokio::test]
async fn test_cache_hit_makes_no_provider_call() {
    let kv = Arc::new(MemoryKv::new());
    let mut seeded = HashMap::new();
    seeded.insert(
        "gemini-2.0-flash:hello".to_string(),
        CacheEntry {
            response: "cached answer".into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    );
    kv.seed(CACHE_STORAGE_KEY, &serde_json::to_string(&seeded).unwrap());

    let h = harness_with(vec![], test_config(), kv).await;
    let events = send(&h.orch, "hello").await;

    assert_eq!(h.provider.call_count(), 0);
    assert!(events.contains(&ChatEvent::CacheHit {
        model: model("gemini-2.0-flash")
    }));
    match events.last().unwrap() {
        ChatEvent::Complete {
            text,
            source,
            elapsed_secs,
            ..
        } => {
            assert_eq!(text, "cached answer");
            assert_eq!(*source, TurnSource::Cache);
            assert_eq!(*elapsed_secs, 0.0);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert_eq!(h.orch.prefs().request_count().await, 0);
    assert!(h.orch.metrics().snapshot().await.is_empty());
}

#[tokio::test]
async fn test_streamed_reply_is_assembled_recorded_and_cached() {
    let h = harness(vec![Script::Stream(vec!["He", "llo!"])]).await;
    let events = send(&h.orch, "hello").await;

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ContentDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["He", "llo!"]);
    assert_eq!(completed_text(&events), Some("Hello!"));
    assert!(matches!(
        events.first(),
        Some(ChatEvent::Started { model: m, .. }) if *m == model("gemini-2.0-flash")
    ));

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].options.stream);
    assert_eq!(calls[0].prompt, "hello");

    let metrics = h.orch.metrics().get(&model("gemini-2.0-flash")).await.unwrap();
    assert_eq!(metrics.response_count, 1);
    assert_eq!(h.orch.cache().keys().await, vec!["gemini-2.0-flash:hello".to_string()]);
    assert_eq!(h.orch.prefs().request_count().await, 1);

    // Same prompt again is served from the cache
    let events = send(&h.orch, "hello").await;
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { source: TurnSource::Cache, .. })
    ));
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_empty_stream_is_an_empty_response() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let h = harness_with(
        vec![Script::Stream(vec![]), Script::Stream(vec![" ", "\n"])],
        config,
        Arc::new(MemoryKv::new()),
    )
    .await;
    let events = send(&h.orch, "hello").await;

    assert!(completed_text(&events).is_none());
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::StreamFallback { .. })));
    match events.last().unwrap() {
        ChatEvent::Failed { kind, message, .. } => {
            assert_eq!(*kind, ErrorKind::EmptyResponse);
            assert!(message.contains("empty response"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert!(h.orch.cache().is_empty().await);
    assert!(h.orch.metrics().snapshot().await.is_empty());
}

#[tokio::test]
async fn test_missing_text_is_an_invalid_shape() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let h = harness_with(
        vec![http_error(), Script::NoText],
        config,
        Arc::new(MemoryKv::new()),
    )
    .await;
    let events = send(&h.orch, "hello").await;
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Failed { kind: ErrorKind::InvalidResponseShape, .. })
    ));
}

#[tokio::test]
async fn test_blank_batch_reply_is_empty() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let h = harness_with(
        vec![http_error(), Script::Message("   ")],
        config,
        Arc::new(MemoryKv::new()),
    )
    .await;
    let events = send(&h.orch, "hello").await;

    assert!(matches!(
        events.last(),
        Some(ChatEvent::Failed { kind: ErrorKind::EmptyResponse, .. })
    ));
    assert!(h.orch.cache().keys().await.is_empty());
    assert!(h.orch.metrics().get(&model("gemini-2.0-flash")).await.is_none());
}

#[tokio::test]
async fn test_stream_failure_falls_back_to_batch() {
    let h = harness(vec![http_error(), Script::Message("from batch")]).await;
    let events = send(&h.orch, "hello").await;

    assert!(events.contains(&ChatEvent::StreamFallback {
        model: model("gemini-2.0-flash"),
        reason: "HTTP error: connection reset".into(),
    }));
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { source: TurnSource::Batch, text, .. }) if text == "from batch"
    ));
    let calls = h.provider.calls();
    assert!(calls[0].options.stream);
    assert!(!calls[1].options.stream);
    assert_eq!(rotations(&events), 0);
}

#[tokio::test]
async fn test_retry_rotates_once_then_counts_attempts() {
    let h = harness(vec![
        http_error(),
        http_error(),
        http_error(),
        http_error(),
        Script::Stream(vec!["third time"]),
    ])
    .await;
    let events = send(&h.orch, "hello").await;

    assert_eq!(rotations(&events), 1);
    assert!(events.contains(&ChatEvent::ModelRotated {
        from: model("gemini-2.0-flash"),
        to: model("gemini-1.5-flash"),
    }));
    assert_eq!(retries(&events), vec![(2, 3)]);
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { model: m, .. }) if *m == model("gemini-1.5-flash")
    ));

    let models: Vec<ModelId> = h.provider.calls().into_iter().map(|c| c.options.model).collect();
    assert_eq!(models[0], model("gemini-2.0-flash"));
    assert!(models[2..].iter().all(|m| *m == model("gemini-1.5-flash")));
    assert_eq!(h.orch.selected_model().await, model("gemini-1.5-flash"));
    // One request per attempt
    assert_eq!(h.orch.prefs().request_count().await, 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_original_prompt() {
    let h = harness((0..8).map(|_| http_error()).collect()).await;
    h.orch.set_thinking_mode(true).await.unwrap();
    let prompt = "why is the sky blue?";
    let events = send(&h.orch, prompt).await;

    assert_eq!(rotations(&events), 1);
    assert_eq!(retries(&events), vec![(2, 3), (3, 3)]);
    match events.last().unwrap() {
        ChatEvent::Failed {
            message,
            kind,
            retry_prompt,
        } => {
            assert_eq!(message, "Error: HTTP error: connection reset");
            assert_eq!(*kind, ErrorKind::ProviderError);
            assert_eq!(retry_prompt.as_deref(), Some(prompt));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 8);
    assert!(calls[0].prompt.starts_with("I need a well-reasoned"));
    assert!(calls[0].prompt.contains(prompt));
    assert_eq!(calls[0].options.temperature, Some(0.7));
    assert_eq!(calls[0].options.max_tokens, Some(2500));

    let session = h.orch.session().await;
    let last = session.transcript.last().unwrap();
    assert_eq!(last.role, TurnRole::System);
    assert!(last.is_error);

    // The failed prompt can be resubmitted as typed
    h.provider.push(Script::Stream(vec!["Rayleigh scattering"]));
    let (rx, _cancel) = h.orch.retry_last_failed().await.unwrap();
    let events = drain(rx).await;
    assert_eq!(completed_text(&events), Some("Rayleigh scattering"));
    assert!(h.provider.calls()[8].prompt.contains(prompt));
    assert!(matches!(
        h.orch.retry_last_failed().await,
        Err(ChatError::NothingToRetry)
    ));
}

#[tokio::test]
async fn test_timeout_cancels_call_and_falls_back() {
    let h = harness(vec![Script::Hang, Script::Message("recovered")]).await;
    let events = send(&h.orch, "hello").await;

    let reason = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::StreamFallback { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .unwrap();
    assert!(reason.contains("timed out"));
    assert_eq!(completed_text(&events), Some("recovered"));
    assert!(h.provider.tokens.lock().unwrap()[0].is_cancelled());
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let h = harness(vec![Script::Stall(vec!["partial"]), Script::Message("done")]).await;
    let events = send(&h.orch, "hello").await;

    let delta_at = events
        .iter()
        .position(|e| matches!(e, ChatEvent::ContentDelta { .. }))
        .unwrap();
    let fallback_at = events
        .iter()
        .position(|e| matches!(e, ChatEvent::StreamFallback { .. }))
        .unwrap();
    assert!(delta_at < fallback_at);
    assert_eq!(completed_text(&events), Some("done"));
}

#[tokio::test]
async fn test_user_abort_stops_without_retry() {
    let h = harness(vec![Script::Hang]).await;
    let (mut rx, cancel) = h.orch.submit("hello").await.unwrap();
    assert!(matches!(rx.recv().await, Some(ChatEvent::Started { .. })));
    cancel.cancel();

    let events = drain(rx).await;
    assert!(matches!(events.last(), Some(ChatEvent::Aborted { .. })));
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::Failed { .. })));
    assert_eq!(rotations(&events), 0);
    assert_eq!(h.provider.call_count(), 1);
    assert!(h.provider.tokens.lock().unwrap()[0].is_cancelled());
    assert!(!h.orch.is_busy());
}

#[tokio::test]
async fn test_consent_error_skips_retry_loop() {
    let h = harness(vec![consent_error(), consent_error()]).await;
    let events = send(&h.orch, "hello").await;

    // Stream, then the batch fallback, then no rotation or retries
    let calls = h.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].options.stream);
    assert!(!calls[1].options.stream);
    assert_eq!(rotations(&events), 0);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ChatEvent::Retrying { .. })));
    match events.last().unwrap() {
        ChatEvent::ConsentRequired {
            model: m,
            popup_blocked,
            retry_prompt,
            hint,
            ..
        } => {
            assert_eq!(*m, model("gemini-2.0-flash"));
            assert!(!popup_blocked);
            assert_eq!(retry_prompt, "hello");
            assert!(hint.contains("/retry"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }

    // Later attempts go non-streamed first
    h.provider.push(Script::Message("granted"));
    let (rx, _cancel) = h.orch.retry_last_failed().await.unwrap();
    let events = drain(rx).await;
    assert!(!h.provider.calls()[2].options.stream);
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { source: TurnSource::Batch, .. })
    ));
}

#[tokio::test]
async fn test_consent_error_on_stream_falls_back_to_batch() {
    let h = harness(vec![consent_error(), Script::Message("batch answer")]).await;
    let events = send(&h.orch, "hello").await;

    assert_eq!(h.provider.call_count(), 2);
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { text, source: TurnSource::Batch, .. }) if text == "batch answer"
    ));
}

#[tokio::test]
async fn test_batch_first_consent_error_falls_through_to_stream() {
    let h = harness(vec![consent_error(), consent_error()]).await;
    send(&h.orch, "first").await;

    h.provider.push(consent_error());
    h.provider.push(Script::Stream(vec!["stream", "ed"]));
    let events = send(&h.orch, "second").await;

    let calls = h.provider.calls();
    assert!(!calls[2].options.stream);
    assert!(calls[3].options.stream);
    assert_eq!(completed_text(&events), Some("streamed"));
}

#[tokio::test]
async fn test_final_message_after_consent_seen() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let h = harness_with(
        vec![consent_error(), consent_error(), http_error(), http_error()],
        config,
        Arc::new(MemoryKv::new()),
    )
    .await;
    send(&h.orch, "first").await;
    let events = send(&h.orch, "second").await;
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Failed { message, .. }) if message == CONSENT_FINAL_MESSAGE
    ));
}

#[tokio::test]
async fn test_second_submission_is_rejected_while_busy() {
    let h = harness(vec![Script::Hang]).await;
    let (rx, cancel) = h.orch.submit("first").await.unwrap();
    assert!(h.orch.is_busy());
    assert!(matches!(h.orch.submit("second").await, Err(ChatError::Busy)));
    assert!(matches!(h.orch.new_chat().await, Err(ChatError::Busy)));

    cancel.cancel();
    drain(rx).await;
    assert!(!h.orch.is_busy());

    h.provider.push(Script::Stream(vec!["ok"]));
    let events = send(&h.orch, "third").await;
    assert_eq!(completed_text(&events), Some("ok"));
}

#[tokio::test]
async fn test_empty_prompt_rejected() {
    let h = harness(vec![]).await;
    assert!(matches!(h.orch.submit("   ").await, Err(ChatError::EmptyPrompt)));
    assert!(matches!(
        h.orch.retry_last_failed().await,
        Err(ChatError::NothingToRetry)
    ));
    assert!(matches!(
        h.orch.regenerate(None).await,
        Err(ChatError::EmptyPrompt)
    ));
    assert!(!h.orch.is_busy());
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_speed_mode_substitutes_model() {
    let h = harness(vec![Script::Stream(vec!["quick"])]).await;
    h.orch.set_model(&model("gpt-4o")).await.unwrap();
    assert_eq!(h.orch.set_speed_mode(true).await.unwrap(), SPEED_ON_NOTICE);

    let events = send(&h.orch, "hello").await;
    assert!(events.contains(&ChatEvent::ModelSubstituted {
        from: model("gpt-4o"),
        to: model("gemini-2.0-flash"),
        mode: Mode::Speed,
    }));
    let calls = h.provider.calls();
    assert_eq!(calls[0].options.model, model("gemini-2.0-flash"));
    assert_eq!(calls[0].options.temperature, Some(0.3));
    assert_eq!(calls[0].options.max_tokens, Some(1024));
    assert_eq!(calls[0].prompt, "hello");
    assert_eq!(h.orch.cache().keys().await, vec!["gemini-2.0-flash:hello".to_string()]);
    // The user's selection is left alone
    assert_eq!(h.orch.selected_model().await, model("gpt-4o"));
}

#[tokio::test]
async fn test_mode_toggles_are_exclusive() {
    let h = harness(vec![]).await;
    assert_eq!(h.orch.mode().await, Mode::Normal);

    assert_eq!(h.orch.toggle_speed_mode().await.unwrap(), SPEED_ON_NOTICE);
    assert_eq!(h.orch.mode().await, Mode::Speed);

    assert_eq!(h.orch.toggle_thinking_mode().await.unwrap(), THINKING_ON_NOTICE);
    assert_eq!(h.orch.mode().await, Mode::Thinking);
    assert_eq!(h.kv.get_now(SPEED_MODE_KEY).as_deref(), Some("false"));
    assert_eq!(h.kv.get_now(THINKING_MODE_KEY).as_deref(), Some("true"));

    assert_eq!(h.orch.toggle_thinking_mode().await.unwrap(), THINKING_OFF_NOTICE);
    assert_eq!(h.orch.mode().await, Mode::Normal);

    let notices = h
        .orch
        .session()
        .await
        .transcript
        .iter()
        .filter(|t| t.role == TurnRole::System)
        .count();
    assert_eq!(notices, 3);
}

#[tokio::test]
async fn test_faster_model_suggested_but_not_applied() {
    let kv = Arc::new(MemoryKv::new());
    kv.seed(
        METRICS_STORAGE_KEY,
        &serde_json::json!({
            "gpt-4o": {"avgResponseTime": 8.0, "responseCount": 5, "lastResponseTime": 8.0},
            "gemini-2.0-flash": {"avgResponseTime": 2.0, "responseCount": 4, "lastResponseTime": 2.0}
        })
        .to_string(),
    );
    let h = harness_with(vec![Script::Stream(vec!["answer"])], test_config(), kv).await;
    h.orch.set_model(&model("gpt-4o")).await.unwrap();

    let events = send(&h.orch, "hello").await;
    assert!(events.contains(&ChatEvent::FasterModelSuggested {
        current: model("gpt-4o"),
        suggested: model("gemini-2.0-flash"),
        speedup: 4.0,
    }));
    assert_eq!(h.provider.calls()[0].options.model, model("gpt-4o"));
}

#[tokio::test]
async fn test_vision_request_uses_attachment_once() {
    let h = harness(vec![Script::Message("a cat on a mat")]).await;
    h.orch.set_model(&model("gpt-4o-vision")).await.unwrap();
    h.orch.attach_image("https://example.com/cat.png").await.unwrap();

    let events = send(&h.orch, "what is this?").await;
    assert!(matches!(
        events.last(),
        Some(ChatEvent::Complete { source: TurnSource::Vision, text, .. }) if text == "a cat on a mat"
    ));
    let calls = h.provider.calls();
    assert_eq!(calls[0].image_url.as_deref(), Some("https://example.com/cat.png"));
    assert!(!calls[0].options.stream);
    assert!(h.orch.attachment().await.is_none());
    assert!(h.orch.cache().is_empty().await);
}

#[tokio::test]
async fn test_image_generation_single_attempt() {
    let h = harness(vec![]).await;
    h.orch.set_model(&model("dall-e-3")).await.unwrap();
    h.provider.images.lock().unwrap().push_back(Ok(ImageResource {
        url: "https://example.com/out.png".into(),
    }));

    let events = send(&h.orch, "a lighthouse at dusk").await;
    assert!(matches!(
        events.last(),
        Some(ChatEvent::ImageGenerated { url, .. }) if url == "https://example.com/out.png"
    ));
    let session = h.orch.session().await;
    assert_eq!(session.transcript.last().unwrap().source, Some(TurnSource::Image));

    let events = send(&h.orch, "another one").await;
    match events.last().unwrap() {
        ChatEvent::Failed {
            message,
            retry_prompt,
            ..
        } => {
            assert!(message.starts_with("Error: Failed to generate image:"));
            assert_eq!(retry_prompt.as_deref(), Some("another one"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert!(retries(&events).is_empty());
    assert_eq!(h.provider.image_calls.lock().unwrap().len(), 2);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_regenerate_replaces_last_reply() {
    let h = harness(vec![
        Script::Stream(vec!["first draft"]),
        Script::Stream(vec!["second draft"]),
    ])
    .await;
    send(&h.orch, "write a haiku").await;

    let (rx, _cancel) = h.orch.regenerate(Some("shorter")).await.unwrap();
    let events = drain(rx).await;
    assert_eq!(completed_text(&events), Some("second draft"));
    assert_eq!(
        h.provider.calls()[1].prompt,
        "write a haiku\n\nPlease improve your response. User feedback: shorter"
    );

    let session = h.orch.session().await;
    let texts: Vec<&str> = session.transcript.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, vec!["write a haiku", "second draft"]);
}

#[tokio::test]
async fn test_regenerate_bypasses_cache() {
    let h = harness(vec![
        Script::Stream(vec!["first"]),
        Script::Stream(vec!["second"]),
    ])
    .await;
    send(&h.orch, "hello").await;

    let (rx, _cancel) = h.orch.regenerate(None).await.unwrap();
    let events = drain(rx).await;
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::CacheHit { .. })));
    assert_eq!(completed_text(&events), Some("second"));
    assert_eq!(h.provider.calls()[1].prompt, "hello");
}

#[tokio::test]
async fn test_chats_saved_listed_and_deleted() {
    let h = harness(vec![Script::Stream(vec!["hi there"])]).await;
    send(&h.orch, "hello").await;

    let chats = h.orch.list_chats().await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].title, "hello");
    let id = chats[0].id.clone();

    // A chat without user turns is never saved
    h.orch.new_chat().await.unwrap();
    h.orch.shutdown().await;
    assert_eq!(h.orch.list_chats().await.unwrap().len(), 1);

    let loaded = h.orch.load_chat(&id).await.unwrap();
    assert_eq!(loaded.transcript.len(), 2);
    assert_eq!(h.orch.session().await.id, id);

    h.orch.delete_chat(&id).await.unwrap();
    assert!(h.orch.list_chats().await.unwrap().is_empty());
    assert_ne!(h.orch.session().await.id, id);
    assert!(h.orch.load_chat(&id).await.is_err());
}

#[tokio::test]
async fn test_unknown_model_rejected() {
    let h = harness(vec![]).await;
    assert!(matches!(
        h.orch.set_model(&model("gpt-2")).await,
        Err(ChatError::UnknownModel(_))
    ));
    assert_eq!(h.orch.selected_model().await, model("gemini-2.0-flash"));
}

#[tokio::test]
async fn test_unknown_default_model_falls_back_to_catalog() {
    let mut config = test_config();
    config.default_model = model("retired-model");
    let h = harness_with(vec![], config, Arc::new(MemoryKv::new())).await;
    assert_eq!(h.orch.selected_model().await, model("gemini-2.0-flash"));
}

// ---- Final error text ----

#[test]
fn test_final_error_message() {
    let err = ChatError::Provider(ProviderError::Http("boom".into()));
    assert_eq!(
        final_error_message(&err, Mode::Normal, false),
        "Error: HTTP error: boom"
    );
    assert_eq!(
        final_error_message(&err, Mode::Normal, true),
        CONSENT_FINAL_MESSAGE
    );

    let limit = ChatError::Provider(ProviderError::Api {
        status: 400,
        message: "exceeded token limit".into(),
    });
    assert_eq!(
        final_error_message(&limit, Mode::Thinking, false),
        THINKING_TOKEN_LIMIT_MESSAGE
    );
    assert!(final_error_message(&limit, Mode::Speed, false).starts_with("Error: API error"));
}

// ---- Selection policy ----

#[test]
fn test_policy_substitution_rules() {
    let catalog = ModelCatalog::builtin();
    let config = AppConfig::default();
    let table = MetricsTable::new();
    let pick = |id: &str, mode| {
        select_model(&model(id), mode, &config.speed, &config.thinking, &table, &catalog)
    };

    let s = pick("gpt-4o", Mode::Speed);
    assert_eq!(s.model, model("gemini-2.0-flash"));
    assert_eq!(s.substituted_from, Some(model("gpt-4o")));

    let s = pick("claude-3-haiku", Mode::Speed);
    assert_eq!(s.model, model("claude-3-haiku"));
    assert!(s.substituted_from.is_none());

    let s = pick("gemini-1.5-flash", Mode::Thinking);
    assert_eq!(s.model, model("claude-3-5-sonnet"));

    assert_eq!(pick("dall-e-3", Mode::Speed).model, model("dall-e-3"));
    assert_eq!(pick("gpt-4o-vision", Mode::Thinking).model, model("gpt-4o-vision"));
    assert_eq!(pick("gpt-4o", Mode::Normal).model, model("gpt-4o"));
}

#[test]
fn test_policy_suggestion_only_in_normal_mode() {
    let catalog = ModelCatalog::builtin();
    let config = AppConfig::default();
    let mut table = MetricsTable::new();
    table.insert(
        model("gpt-4o"),
        ModelMetrics {
            avg_response_time: 9.0,
            response_count: 3,
            last_response_time: 9.0,
        },
    );
    table.insert(
        model("claude-3-haiku"),
        ModelMetrics {
            avg_response_time: 3.0,
            response_count: 3,
            last_response_time: 3.0,
        },
    );

    let normal = select_model(
        &model("gpt-4o"),
        Mode::Normal,
        &config.speed,
        &config.thinking,
        &table,
        &catalog,
    );
    assert_eq!(normal.model, model("gpt-4o"));
    assert_eq!(normal.suggestion.unwrap().model, model("claude-3-haiku"));

    let thinking = select_model(
        &model("gpt-4o"),
        Mode::Thinking,
        &config.speed,
        &config.thinking,
        &table,
        &catalog,
    );
    assert!(thinking.suggestion.is_none());
}

// ---- Prompt shaping ----

#[test]
fn test_prompt_shaping() {
    let wrapped = wrap_thinking("What is 2+2?");
    assert!(wrapped.starts_with("I need a well-reasoned, step-by-step analysis"));
    assert!(wrapped.contains("4. Conclusion or recommendation"));
    assert!(wrapped.contains("The question or request is: \n\nWhat is 2+2?\n\n"));
    assert_eq!(prompt_for_mode("hi", Mode::Speed), "hi");

    assert_eq!(regenerate_prompt("hi", None), "hi");
    assert_eq!(regenerate_prompt("hi", Some("  ")), "hi");

    let config = AppConfig::default();
    let opts = request_options(&model("gpt-4o"), Mode::Normal, true, &config.speed, &config.thinking);
    assert!(opts.temperature.is_none() && opts.max_tokens.is_none() && opts.top_p.is_none());
    let opts = request_options(&model("gpt-4o"), Mode::Thinking, false, &config.speed, &config.thinking);
    assert_eq!(opts.top_p, Some(0.95));
    assert!(!opts.stream);
}

// ---- Templates ----

#[test]
fn test_template_placeholders_and_fill() {
    let template = "Review {{language}} code:\n```{{language}}\n{{code}}\n```";
    assert_eq!(placeholders(template), vec!["language", "code"]);

    let mut values = HashMap::new();
    values.insert("language".to_string(), "Rust".to_string());
    values.insert("code".to_string(), String::new());
    assert_eq!(fill(template, &values), "Review Rust code:\n```Rust\n[Code]\n```");

    assert_eq!(format_placeholder_name("bulletPoints"), "Bullet Points");
    assert_eq!(format_placeholder_name("topic"), "Topic");
    assert_eq!(format_placeholder_name("workHours"), "Work Hours");
}

#[test]
fn test_builtin_templates() {
    let builtin = builtin_templates();
    assert_eq!(builtin.len(), 18);
    assert_eq!(builtin[0].0, "blogPost");
    for category in TemplateCategory::ALL {
        assert_eq!(builtin.iter().filter(|(_, t)| t.category == category).count(), 3);
    }
    assert_eq!(TemplateCategory::parse("CODING"), Some(TemplateCategory::Coding));
    assert_eq!(TemplateCategory::parse("poetry"), None);
}

#[tokio::test]
async fn test_user_templates_persist() {
    let kv = Arc::new(MemoryKv::new());
    let store = TemplateStore::load(kv.clone()).await;

    let id = store
        .create("Standup", "Summarise {{work}} for standup", TemplateCategory::Professional)
        .await
        .unwrap();
    assert!(TemplateStore::is_user_template(&id));
    assert!(!TemplateStore::is_user_template("blogPost"));
    assert_eq!(store.all().await.len(), 19);
    assert_eq!(store.by_category(TemplateCategory::Professional).await.len(), 4);
    assert!(matches!(
        store.create(" ", "prompt", TemplateCategory::Writing).await,
        Err(ChatError::EmptyPrompt)
    ));

    let reloaded = TemplateStore::load(kv.clone()).await;
    assert_eq!(reloaded.get(&id).await.unwrap().title, "Standup");

    assert!(!store.delete("blogPost").await.unwrap());
    assert!(store.delete(&id).await.unwrap());
    assert!(store.get(&id).await.is_none());
}

#[tokio::test]
async fn test_template_export_and_import() {
    let store = TemplateStore::load(Arc::new(MemoryKv::new())).await;
    store
        .create("Retro", "Run a retro on {{sprint}}", TemplateCategory::Professional)
        .await
        .unwrap();
    let exported = store.export().await.unwrap();
    let doc: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(doc["version"], "1.0");
    assert!(doc["exportDate"].is_string());

    let other = TemplateStore::load(Arc::new(MemoryKv::new())).await;
    assert_eq!(other.import(&exported).await.unwrap(), 1);

    let mixed = serde_json::json!({
        "prompts": {
            "a": {"title": "Odd", "prompt": "Do {{thing}}", "category": "astrology"},
            "b": {"title": "No prompt"},
        }
    });
    assert_eq!(other.import(&mixed.to_string()).await.unwrap(), 1);
    let odd = other
        .all()
        .await
        .into_iter()
        .find(|(_, t)| t.title == "Odd")
        .unwrap();
    assert_eq!(odd.1.category, TemplateCategory::Writing);

    assert!(other.import("{\"version\": \"1.0\"}").await.is_err());
}
