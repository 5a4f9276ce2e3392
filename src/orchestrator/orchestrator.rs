use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::config::AppConfig;
use crate::core::error::{ChatError, ErrorKind, StorageError};
use crate::core::message::{Turn, TurnRole, TurnSource};
use crate::core::model::{ModelCatalog, ModelId};
use crate::core::provider::{ChatReply, ChatRequest, Provider};
use crate::core::session::ChatSession;
use crate::storage::{
    ChatSummary, HistoryStore, KvStore, MetricsStore, Mode, Preferences, ResponseCache,
};

use super::context::{AppContext, ConsentProbe, RetryState};
use super::event::ChatEvent;
use super::policy::select_model;
use super::prompt::{prompt_for_mode, regenerate_prompt, request_options};
use super::templates::TemplateStore;

pub const CONSENT_FINAL_MESSAGE: &str = "Error: This application requires popup windows for user consent. Please allow popups for this site, then refresh the page and try again.";

pub const THINKING_TOKEN_LIMIT_MESSAGE: &str = "Error: The model reached its token limit while in thinking mode. Consider breaking your query into smaller parts or disabling thinking mode for this question.";

/// Text shown once the retry budget is spent.
pub fn final_error_message(err: &ChatError, mode: Mode, consent_suspected: bool) -> String {
    if consent_suspected {
        return CONSENT_FINAL_MESSAGE.to_string();
    }
    let text = err.to_string();
    if mode.is_thinking() && text.contains("token limit") {
        return THINKING_TOKEN_LIMIT_MESSAGE.to_string();
    }
    format!("Error: {text}")
}

type EventTx = mpsc::Sender<ChatEvent>;

/// Owns the application context and drives each submission through
/// cache, model selection, streaming with fallback and the retry loop.
/// At most one submission is in flight at a time.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    provider: Arc<dyn Provider>,
    catalog: ModelCatalog,
    config: AppConfig,
    cache: ResponseCache,
    metrics: MetricsStore,
    history: HistoryStore,
    prefs: Preferences,
    templates: TemplateStore,
    consent: Arc<dyn ConsentProbe>,
    context: Mutex<AppContext>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the submission task finishes.
struct FlightGuard(Arc<Shared>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    pub async fn load(
        provider: Arc<dyn Provider>,
        kv: Arc<dyn KvStore>,
        config: AppConfig,
        consent: Arc<dyn ConsentProbe>,
    ) -> Self {
        Self::load_with_catalog(provider, kv, config, consent, ModelCatalog::builtin()).await
    }

    pub async fn load_with_catalog(
        provider: Arc<dyn Provider>,
        kv: Arc<dyn KvStore>,
        config: AppConfig,
        consent: Arc<dyn ConsentProbe>,
        catalog: ModelCatalog,
    ) -> Self {
        let cache = ResponseCache::load(Arc::clone(&kv), config.cache.clone()).await;
        let metrics = MetricsStore::load(Arc::clone(&kv)).await;
        let history = HistoryStore::new(Arc::clone(&kv));
        let prefs = Preferences::load(Arc::clone(&kv)).await;
        let templates = TemplateStore::load(kv).await;

        let selected = if catalog.contains(&config.default_model) {
            config.default_model.clone()
        } else {
            tracing::warn!(
                "Configured default model {} is not in the catalog",
                config.default_model
            );
            catalog
                .first()
                .map(|m| m.id.clone())
                .unwrap_or_else(|| config.default_model.clone())
        };

        Self {
            shared: Arc::new(Shared {
                provider,
                catalog,
                config,
                cache,
                metrics,
                history,
                prefs,
                templates,
                consent,
                context: Mutex::new(AppContext::new(selected)),
                in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Submit a user prompt. Progress arrives on the returned channel,
    /// which closes once the orchestrator is ready for the next
    /// submission; cancelling the token stops the response.
    pub async fn submit(
        &self,
        prompt: &str,
    ) -> Result<(mpsc::Receiver<ChatEvent>, CancellationToken), ChatError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let guard = self.begin()?;
        self.shared
            .context
            .lock()
            .await
            .session
            .push(Turn::user(prompt));
        Ok(self.spawn(prompt.to_string(), true, guard))
    }

    /// Re-run the last user prompt, replacing the trailing assistant turn.
    pub async fn regenerate(
        &self,
        feedback: Option<&str>,
    ) -> Result<(mpsc::Receiver<ChatEvent>, CancellationToken), ChatError> {
        let guard = self.begin()?;
        let prompt = {
            let mut ctx = self.shared.context.lock().await;
            let last = ctx
                .session
                .last_user_prompt()
                .map(str::to_string)
                .ok_or(ChatError::EmptyPrompt)?;
            if matches!(ctx.session.transcript.last(), Some(t) if t.role == TurnRole::Assistant) {
                ctx.session.transcript.pop();
            }
            regenerate_prompt(&last, feedback)
        };
        Ok(self.spawn(prompt, false, guard))
    }

    /// Resubmit the prompt of the last failed or consent-blocked attempt.
    pub async fn retry_last_failed(
        &self,
    ) -> Result<(mpsc::Receiver<ChatEvent>, CancellationToken), ChatError> {
        let guard = self.begin()?;
        let prompt = self
            .shared
            .context
            .lock()
            .await
            .last_failed_prompt
            .take()
            .ok_or(ChatError::NothingToRetry)?;
        Ok(self.spawn(prompt, true, guard))
    }

    fn begin(&self) -> Result<FlightGuard, ChatError> {
        self.shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::Busy)?;
        Ok(FlightGuard(Arc::clone(&self.shared)))
    }

    fn spawn(
        &self,
        prompt: String,
        use_cache: bool,
        guard: FlightGuard,
    ) -> (mpsc::Receiver<ChatEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            shared.run(prompt, use_cache, &tx, cancel_clone).await;
            // Release before closing the channel so a drained receiver
            // means the next submission is accepted.
            drop(guard);
            drop(tx);
        });

        (rx, cancel)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    // --- Chat lifecycle ---

    /// Save the current chat and start a fresh one.
    pub async fn new_chat(&self) -> Result<String, ChatError> {
        let _guard = self.begin()?;
        self.shared.save_session().await;
        let mut ctx = self.shared.context.lock().await;
        ctx.reset_session();
        Ok(ctx.session.id.clone())
    }

    /// Make a saved chat current. Its model becomes the selection when the
    /// catalog still knows it.
    pub async fn load_chat(&self, id: &str) -> Result<ChatSession, ChatError> {
        let _guard = self.begin()?;
        let session = self
            .shared
            .history
            .load(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("chat {id}")))?;
        self.shared.save_session().await;
        let mut ctx = self.shared.context.lock().await;
        if self.shared.catalog.contains(&session.model_id) {
            ctx.selected_model = session.model_id.clone();
        }
        ctx.session = session.clone();
        ctx.attachment = None;
        ctx.last_failed_prompt = None;
        Ok(session)
    }

    /// Deleting the current chat starts a new one.
    pub async fn delete_chat(&self, id: &str) -> Result<(), ChatError> {
        let _guard = self.begin()?;
        self.shared.history.delete(id).await?;
        let mut ctx = self.shared.context.lock().await;
        if ctx.session.id == id {
            ctx.reset_session();
        }
        Ok(())
    }

    pub async fn clear_history(&self) -> Result<(), ChatError> {
        let _guard = self.begin()?;
        self.shared.history.clear().await?;
        self.shared.context.lock().await.reset_session();
        Ok(())
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, ChatError> {
        Ok(self.shared.history.list().await?)
    }

    pub async fn session(&self) -> ChatSession {
        self.shared.context.lock().await.session.clone()
    }

    // --- Selection and modes ---

    pub async fn set_model(&self, id: &ModelId) -> Result<(), ChatError> {
        if !self.shared.catalog.contains(id) {
            return Err(ChatError::UnknownModel(id.to_string()));
        }
        self.shared.context.lock().await.selected_model = id.clone();
        tracing::info!("Selected model {id}");
        Ok(())
    }

    pub async fn selected_model(&self) -> ModelId {
        self.shared.context.lock().await.selected_model.clone()
    }

    /// Attach an image for the next request to a vision model.
    pub async fn attach_image(&self, url: &str) -> Result<(), ChatError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        self.shared.context.lock().await.attachment = Some(url.to_string());
        Ok(())
    }

    pub async fn clear_attachment(&self) {
        self.shared.context.lock().await.attachment = None;
    }

    pub async fn attachment(&self) -> Option<String> {
        self.shared.context.lock().await.attachment.clone()
    }

    pub async fn set_speed_mode(&self, enabled: bool) -> Result<&'static str, ChatError> {
        let notice = self.shared.prefs.set_speed(enabled).await?;
        self.push_notice(notice).await;
        Ok(notice)
    }

    pub async fn set_thinking_mode(&self, enabled: bool) -> Result<&'static str, ChatError> {
        let notice = self.shared.prefs.set_thinking(enabled).await?;
        self.push_notice(notice).await;
        Ok(notice)
    }

    pub async fn toggle_speed_mode(&self) -> Result<&'static str, ChatError> {
        let enabled = !self.shared.prefs.mode().await.is_speed();
        self.set_speed_mode(enabled).await
    }

    pub async fn toggle_thinking_mode(&self) -> Result<&'static str, ChatError> {
        let enabled = !self.shared.prefs.mode().await.is_thinking();
        self.set_thinking_mode(enabled).await
    }

    async fn push_notice(&self, notice: &str) {
        if !notice.is_empty() {
            self.shared
                .context
                .lock()
                .await
                .session
                .push(Turn::system(notice, false));
        }
    }

    pub async fn mode(&self) -> Mode {
        self.shared.prefs.mode().await
    }

    // --- Accessors ---

    pub fn catalog(&self) -> &ModelCatalog {
        &self.shared.catalog
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.shared.cache
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.shared.metrics
    }

    pub fn prefs(&self) -> &Preferences {
        &self.shared.prefs
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.shared.templates
    }

    /// Flush pending cache writes and save the current chat.
    pub async fn shutdown(&self) {
        self.shared.cache.flush().await;
        self.shared.save_session().await;
    }
}

impl Shared {
    async fn run(
        &self,
        prompt: String,
        use_cache: bool,
        tx: &EventTx,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let (chat_id, selected) = {
            let ctx = self.context.lock().await;
            (ctx.session.id.clone(), ctx.selected_model.clone())
        };
        let _ = tx
            .send(ChatEvent::Started {
                chat_id,
                model: selected.clone(),
            })
            .await;

        if self.catalog.supports_image_generation(&selected) {
            self.run_image(&prompt, &selected, tx, &cancel, started).await;
        } else {
            let state = RetryState {
                use_cache,
                ..RetryState::new(prompt, selected)
            };
            self.run_with_retries(state, tx, &cancel, started).await;
        }

        self.save_session().await;
    }

    async fn run_with_retries(
        &self,
        mut state: RetryState,
        tx: &EventTx,
        cancel: &CancellationToken,
        started: Instant,
    ) {
        let max = self.config.retry.max_retries;
        loop {
            let err = match self.attempt(&state, tx, cancel).await {
                Ok(()) => return,
                Err(e) => e.classify(),
            };
            tracing::warn!(
                attempt = state.attempt + 1,
                model = %state.current_model,
                "Attempt failed: {err}"
            );

            match err.kind() {
                ErrorKind::UserAborted => return self.report_aborted(tx, started).await,
                ErrorKind::ConsentRequired => return self.report_consent(&state, tx).await,
                _ => {}
            }
            if state.attempt >= max {
                return self.report_failure(&state, &err, tx).await;
            }

            if state.attempt == 0 {
                if let Some(next) = self.catalog.next_after(&state.current_model) {
                    let next = next.id.clone();
                    tracing::info!("Rotating from {} to {next}", state.current_model);
                    self.context.lock().await.selected_model = next.clone();
                    let _ = tx
                        .send(ChatEvent::ModelRotated {
                            from: state.current_model.clone(),
                            to: next.clone(),
                        })
                        .await;
                    state.current_model = next;
                }
            } else {
                let _ = tx
                    .send(ChatEvent::Retrying {
                        attempt: state.attempt + 1,
                        max,
                    })
                    .await;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.report_aborted(tx, started).await,
                _ = tokio::time::sleep(self.config.retry.delay()) => {}
            }
            state.attempt += 1;
        }
    }

    async fn attempt(
        &self,
        state: &RetryState,
        tx: &EventTx,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let prompt = state.original_prompt.as_str();
        let selected = &state.current_model;

        let cached = if state.use_cache {
            self.cache.lookup(selected, prompt).await
        } else {
            None
        };
        if let Some(text) = cached {
            tracing::debug!("Cache hit for {selected}");
            let _ = tx
                .send(ChatEvent::CacheHit {
                    model: selected.clone(),
                })
                .await;
            self.complete(selected, text, TurnSource::Cache, 0.0, tx).await;
            return Ok(());
        }

        let (attachment, consent_seen) = {
            let ctx = self.context.lock().await;
            (ctx.attachment.clone(), ctx.consent_error_seen)
        };
        self.prefs.increment_requests().await;

        if let Some(url) = attachment.filter(|_| self.catalog.supports_vision(selected)) {
            return self.vision(prompt, &url, selected, tx, cancel).await;
        }

        let mode = self.prefs.mode().await;
        let table = self.metrics.snapshot().await;
        let selection = select_model(
            selected,
            mode,
            &self.config.speed,
            &self.config.thinking,
            &table,
            &self.catalog,
        );
        if let Some(from) = &selection.substituted_from {
            tracing::info!("{mode} mode: using {} instead of {from}", selection.model);
            let _ = tx
                .send(ChatEvent::ModelSubstituted {
                    from: from.clone(),
                    to: selection.model.clone(),
                    mode,
                })
                .await;
        }
        if let Some(s) = &selection.suggestion {
            let _ = tx
                .send(ChatEvent::FasterModelSuggested {
                    current: selected.clone(),
                    suggested: s.model.clone(),
                    speedup: s.speedup,
                })
                .await;
        }

        let model = selection.model;
        let sent = prompt_for_mode(prompt, mode);
        let started = Instant::now();

        // After a consent failure the non-streamed call goes first.
        let primary_stream = !consent_seen;
        let (text, source) = match self
            .call(&sent, None, &model, mode, primary_stream, tx, cancel)
            .await
        {
            Ok(text) => (text, source_for(primary_stream)),
            Err(e) => {
                let e = e.classify();
                // Only a user stop skips the other call
                if e.kind() == ErrorKind::UserAborted {
                    return Err(e);
                }
                tracing::warn!("Falling back for {model}: {e}");
                if primary_stream {
                    let _ = tx
                        .send(ChatEvent::StreamFallback {
                            model: model.clone(),
                            reason: e.to_string(),
                        })
                        .await;
                }
                let text = self
                    .call(&sent, None, &model, mode, !primary_stream, tx, cancel)
                    .await?;
                (text, source_for(!primary_stream))
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record(&model, elapsed).await;
        self.cache.store(&model, &sent, &text).await;
        self.complete(&model, text, source, elapsed, tx).await;
        Ok(())
    }

    /// Vision requests are never streamed or cached.
    async fn vision(
        &self,
        prompt: &str,
        image_url: &str,
        model: &ModelId,
        tx: &EventTx,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let started = Instant::now();
        let text = self
            .call(prompt, Some(image_url), model, Mode::Normal, false, tx, cancel)
            .await?;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record(model, elapsed).await;
        self.context.lock().await.attachment = None;
        self.complete(model, text, TurnSource::Vision, elapsed, tx).await;
        Ok(())
    }

    /// One provider call raced against the request timeout. For streamed
    /// replies the window restarts with every fragment.
    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        prompt: &str,
        image_url: Option<&str>,
        model: &ModelId,
        mode: Mode,
        stream: bool,
        tx: &EventTx,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        let request = ChatRequest {
            prompt: prompt.to_string(),
            image_url: image_url.map(str::to_string),
            options: request_options(
                model,
                mode,
                stream,
                &self.config.speed,
                &self.config.thinking,
            ),
        };
        let window = self.config.timeouts.request();
        let child = cancel.child_token();
        let timed_out = || {
            child.cancel();
            ChatError::Timeout {
                model: self.catalog.display_name(model),
                after_secs: window.as_secs_f64(),
            }
        };

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::UserAborted),
            r = tokio::time::timeout(window, self.provider.chat(&request, child.clone())) => match r {
                Ok(reply) => reply?,
                Err(_) => return Err(timed_out()),
            },
        };

        let mut fragments = match reply {
            ChatReply::Message(message) => {
                let Some(text) = message.first_text() else {
                    return Err(ChatError::InvalidResponseShape {
                        model: self.catalog.display_name(model),
                    });
                };
                if text.trim().is_empty() {
                    return Err(ChatError::EmptyResponse {
                        model: self.catalog.display_name(model),
                    });
                }
                return Ok(text.to_string());
            }
            ChatReply::Stream(fragments) => fragments,
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::UserAborted),
                n = tokio::time::timeout(window, fragments.next()) => n,
            };
            match next {
                Err(_) => return Err(timed_out()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(fragment))) => {
                    let Some(delta) = fragment.text.filter(|t| !t.is_empty()) else {
                        continue;
                    };
                    text.push_str(&delta);
                    let _ = tx.send(ChatEvent::ContentDelta { text: delta }).await;
                }
            }
        }

        if text.trim().is_empty() {
            return Err(ChatError::EmptyResponse {
                model: self.catalog.display_name(model),
            });
        }
        Ok(text)
    }

    /// Image generation is a single attempt with its own timeout.
    async fn run_image(
        &self,
        prompt: &str,
        model: &ModelId,
        tx: &EventTx,
        cancel: &CancellationToken,
        started: Instant,
    ) {
        self.prefs.increment_requests().await;
        let window = self.config.timeouts.image();
        let child = cancel.child_token();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::UserAborted),
            r = tokio::time::timeout(window, self.provider.generate_image(prompt, model, child.clone())) => match r {
                Ok(r) => r.map_err(ChatError::from),
                Err(_) => {
                    child.cancel();
                    Err(ChatError::Timeout {
                        model: self.catalog.display_name(model),
                        after_secs: window.as_secs_f64(),
                    })
                }
            },
        };

        match result {
            Ok(image) => {
                let elapsed = started.elapsed().as_secs_f64();
                self.metrics.record(model, elapsed).await;
                {
                    let mut ctx = self.context.lock().await;
                    ctx.session.push(Turn::assistant(
                        image.url.clone(),
                        model.clone(),
                        TurnSource::Image,
                        elapsed,
                    ));
                    ctx.last_failed_prompt = None;
                }
                let _ = tx
                    .send(ChatEvent::ImageGenerated {
                        url: image.url,
                        model: model.clone(),
                        elapsed_secs: elapsed,
                    })
                    .await;
            }
            Err(e) if e.kind() == ErrorKind::UserAborted => {
                self.report_aborted(tx, started).await;
            }
            Err(e) => {
                let e = e.classify();
                tracing::warn!("Image generation with {model} failed: {e}");
                let message = format!("Error: Failed to generate image: {e}");
                self.record_failure(prompt, &message).await;
                let _ = tx
                    .send(ChatEvent::Failed {
                        message,
                        kind: e.kind(),
                        retry_prompt: Some(prompt.to_string()),
                    })
                    .await;
            }
        }
    }

    async fn complete(
        &self,
        model: &ModelId,
        text: String,
        source: TurnSource,
        elapsed_secs: f64,
        tx: &EventTx,
    ) {
        {
            let mut ctx = self.context.lock().await;
            ctx.session.push(Turn::assistant(
                text.clone(),
                model.clone(),
                source,
                elapsed_secs,
            ));
            ctx.last_failed_prompt = None;
        }
        let _ = tx
            .send(ChatEvent::Complete {
                text,
                model: model.clone(),
                elapsed_secs,
                source,
            })
            .await;
    }

    async fn report_aborted(&self, tx: &EventTx, started: Instant) {
        tracing::info!("Response stopped by user");
        let _ = tx
            .send(ChatEvent::Aborted {
                elapsed_secs: started.elapsed().as_secs_f64(),
            })
            .await;
    }

    async fn report_consent(&self, state: &RetryState, tx: &EventTx) {
        let popup_blocked = self.consent.popup_blocked();
        let hint = self.consent.hint();
        let message = format!(
            "Error: {} needs your consent before it can answer. {hint}",
            self.catalog.display_name(&state.current_model)
        );
        {
            let mut ctx = self.context.lock().await;
            ctx.consent_error_seen = true;
            ctx.last_failed_prompt = Some(state.original_prompt.clone());
            ctx.session.push(Turn::system(message.clone(), true));
        }
        let _ = tx
            .send(ChatEvent::ConsentRequired {
                model: state.current_model.clone(),
                popup_blocked,
                message,
                hint,
                retry_prompt: state.original_prompt.clone(),
            })
            .await;
    }

    async fn report_failure(&self, state: &RetryState, err: &ChatError, tx: &EventTx) {
        let mode = self.prefs.mode().await;
        let consent_seen = self.context.lock().await.consent_error_seen;
        let suspected = consent_seen || self.consent.popup_blocked();
        let message = final_error_message(err, mode, suspected);
        self.record_failure(&state.original_prompt, &message).await;
        let _ = tx
            .send(ChatEvent::Failed {
                message,
                kind: err.kind(),
                retry_prompt: Some(state.original_prompt.clone()),
            })
            .await;
    }

    async fn record_failure(&self, prompt: &str, message: &str) {
        let mut ctx = self.context.lock().await;
        ctx.last_failed_prompt = Some(prompt.to_string());
        ctx.session.push(Turn::system(message, true));
    }

    async fn save_session(&self) {
        let snapshot = {
            let mut guard = self.context.lock().await;
            let ctx = &mut *guard;
            ctx.session.model_id = ctx.selected_model.clone();
            ctx.session.refresh_title();
            ctx.session.touch();
            ctx.session.clone()
        };
        if let Err(e) = self.history.save(&snapshot).await {
            tracing::warn!("Failed to save chat {}: {e}", snapshot.id);
        }
    }
}

fn source_for(stream: bool) -> TurnSource {
    if stream {
        TurnSource::Stream
    } else {
        TurnSource::Batch
    }
}
