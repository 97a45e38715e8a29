//! Generation coordinator.
//!
//! Owns the single in-flight generation of a project and is the only place
//! generated text is committed to the [`ArtifactVersionStore`]:
//!
//! 1. Pick the adapter for the requested provider (or the background poller
//!    for deep-research models)
//! 2. Connect with retry, surfacing each backoff as a `Status` event
//! 3. Forward chunks in wire order
//! 4. On `Done`, and only if the generation was not cancelled, append the
//!    final text and record token usage
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = GenerationCoordinator::new(registry, store, usage);
//! let request = GenerationRequest::new("Describe the idea", "gemini-2.5-flash");
//! let outcome = coordinator
//!     .run(ArtifactSection::Research, ProviderKind::Gemini, request, |event| {
//!         if let StreamEvent::Chunk { text } = event {
//!             print!("{text}");
//!         }
//!     })
//!     .await;
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::background::{PollerConfig, run_background_task};
use super::provider::ProviderKind;
use super::registry::ProviderRegistry;
use super::retry::{RetryNotice, RetryPolicy, with_retry};
use super::tokens::{TokenEstimator, TokenUsage};
use super::{GenerationRequest, ProviderAdapter};
use crate::artifact::{ArtifactSection, ArtifactVersionStore};
use crate::error::{ErrorKind, GenerationError, Result};
use crate::normalized::{EventStream, StreamEvent, UsageReport};

/// Lifecycle of the most recent generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    #[default]
    Idle,
    Generating,
    Committed,
    Cancelled,
    Failed,
}

/// How a generation driven by [`GenerationCoordinator::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Final text appended at `index` in the section's history.
    Committed { index: usize },
    /// Aborted; chunks already delivered are kept only by the caller.
    Cancelled { partial_text: String },
    Failed(GenerationError),
}

#[derive(Debug, Default)]
struct Inflight {
    state: GenerationState,
    epoch: u64,
    cancel: Option<CancellationToken>,
    last_commit: Option<(ArtifactSection, usize)>,
}

/// Per-project generation driver.
#[derive(Clone)]
pub struct GenerationCoordinator {
    registry: Arc<ProviderRegistry>,
    store: Arc<AsyncMutex<ArtifactVersionStore>>,
    usage: Arc<AsyncMutex<TokenUsage>>,
    retry: RetryPolicy,
    poller: PollerConfig,
    estimator: TokenEstimator,
    inflight: Arc<Mutex<Inflight>>,
}

impl std::fmt::Debug for GenerationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationCoordinator")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("state", &self.state())
            .finish()
    }
}

enum ConnectStep {
    Notice(RetryNotice),
    Connected(Result<EventStream>),
}

/// Marks the generation cancelled when its stream is dropped unfinished.
struct InflightGuard {
    inflight: Arc<Mutex<Inflight>>,
    epoch: u64,
    cancel: CancellationToken,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.epoch == self.epoch && inflight.state == GenerationState::Generating {
            self.cancel.cancel();
            inflight.state = GenerationState::Cancelled;
            inflight.cancel = None;
        }
    }
}

impl GenerationCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<AsyncMutex<ArtifactVersionStore>>,
        usage: Arc<AsyncMutex<TokenUsage>>,
    ) -> Self {
        Self {
            registry,
            store,
            usage,
            retry: RetryPolicy::default(),
            poller: PollerConfig::default(),
            estimator: TokenEstimator::default(),
            inflight: Arc::new(Mutex::new(Inflight::default())),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_poller_config(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    #[must_use]
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AsyncMutex<ArtifactVersionStore>> {
        &self.store
    }

    #[must_use]
    pub fn usage(&self) -> &Arc<AsyncMutex<TokenUsage>> {
        &self.usage
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> GenerationState {
        self.lock().state
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.state() == GenerationState::Generating
    }

    /// Section and index of the most recent commit.
    #[must_use]
    pub fn last_commit(&self) -> Option<(ArtifactSection, usize)> {
        self.lock().last_commit
    }

    /// Cancel the in-flight generation, if any. Safe to call repeatedly.
    pub fn cancel(&self) {
        let mut inflight = self.lock();
        if let Some(token) = &inflight.cancel {
            token.cancel();
        }
        if inflight.state == GenerationState::Generating {
            inflight.state = GenerationState::Cancelled;
        }
    }

    fn begin(&self, cancel: CancellationToken) -> u64 {
        let mut inflight = self.lock();
        Self::admit(&mut inflight, cancel)
    }

    fn try_begin(&self, cancel: CancellationToken) -> Result<u64> {
        let mut inflight = self.lock();
        if inflight.state == GenerationState::Generating {
            return Err(GenerationError::new(
                ErrorKind::InvalidRequest,
                "A generation is already running for this project.",
            ));
        }
        Ok(Self::admit(&mut inflight, cancel))
    }

    fn admit(inflight: &mut Inflight, cancel: CancellationToken) -> u64 {
        inflight.epoch += 1;
        inflight.state = GenerationState::Generating;
        inflight.cancel = Some(cancel);
        inflight.epoch
    }

    fn finish(&self, epoch: u64, state: GenerationState) {
        let mut inflight = self.lock();
        if inflight.epoch == epoch {
            inflight.state = state;
            inflight.cancel = None;
        }
    }

    /// Start a generation and stream its events.
    ///
    /// The stream ends with `Done` after the result was committed, with
    /// `Error` on failure, or with no terminal event when cancelled.
    #[must_use]
    pub fn generate(
        &self,
        section: ArtifactSection,
        provider: ProviderKind,
        request: GenerationRequest,
    ) -> EventStream {
        let epoch = self.begin(request.cancel.clone());
        self.stream(epoch, section, provider, request)
    }

    /// Like [`generate`](Self::generate), but refuses to start while another
    /// generation is in flight. The check and the start happen under one lock.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error when a generation is already running.
    pub fn try_generate(
        &self,
        section: ArtifactSection,
        provider: ProviderKind,
        request: GenerationRequest,
    ) -> Result<EventStream> {
        let epoch = self.try_begin(request.cancel.clone())?;
        Ok(self.stream(epoch, section, provider, request))
    }

    fn stream(
        &self,
        epoch: u64,
        section: ArtifactSection,
        provider: ProviderKind,
        request: GenerationRequest,
    ) -> EventStream {
        let this = self.clone();
        let cancel = request.cancel.clone();
        let guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            epoch,
            cancel: cancel.clone(),
        };
        let request_id = Uuid::new_v4();

        tracing::info!(
            request_id = %request_id,
            section = %section,
            provider = %provider,
            model = %request.model_id,
            grounded = request.grounding_enabled,
            "Starting generation"
        );

        Box::pin(async_stream::stream! {
            let _guard = guard;
            let adapter = match this.registry.get(provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    this.finish(epoch, GenerationState::Failed);
                    yield StreamEvent::from_error(&e);
                    return;
                }
            };

            let background = if adapter.descriptor().is_background_model(&request.model_id) {
                adapter.background_api()
            } else {
                None
            };

            let mut inner = if let Some(api) = background {
                tracing::info!(request_id = %request_id, "Routing to background task poller");
                run_background_task(api, request.clone(), this.poller)
            } else {
                let (tx, mut rx) = mpsc::unbounded_channel::<RetryNotice>();
                let adapter_ref: &dyn ProviderAdapter = adapter.as_ref();
                let request_ref = &request;
                let connect = with_retry(
                    &this.retry,
                    &cancel,
                    move |_| adapter_ref.connect(request_ref),
                    move |notice| {
                        let _ = tx.send(notice.clone());
                    },
                );
                futures::pin_mut!(connect);

                let connected = loop {
                    let step = tokio::select! {
                        biased;
                        () = cancel.cancelled() => ConnectStep::Connected(Err(GenerationError::aborted())),
                        Some(notice) = rx.recv() => ConnectStep::Notice(notice),
                        result = &mut connect => ConnectStep::Connected(result),
                    };
                    match step {
                        // Notices queued before a cancel are dropped.
                        ConnectStep::Notice(_) if cancel.is_cancelled() => {}
                        ConnectStep::Notice(notice) => yield StreamEvent::status(notice.message()),
                        ConnectStep::Connected(result) => break result,
                    }
                };

                match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        if e.is_aborted() || cancel.is_cancelled() {
                            tracing::info!(request_id = %request_id, "Generation cancelled before connecting");
                            this.finish(epoch, GenerationState::Cancelled);
                            return;
                        }
                        tracing::warn!(request_id = %request_id, error = %e, kind = %e.kind(), "Generation failed to connect");
                        this.finish(epoch, GenerationState::Failed);
                        yield StreamEvent::from_error(&e);
                        return;
                    }
                }
            };

            let mut chunks = 0usize;
            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    next = inner.next() => next,
                };
                let Some(event) = next else { break };
                if cancel.is_cancelled() {
                    break;
                }

                match event {
                    StreamEvent::Chunk { .. } => {
                        chunks += 1;
                        yield event;
                    }
                    StreamEvent::Status { .. } => yield event,
                    StreamEvent::Error { .. } => {
                        tracing::warn!(request_id = %request_id, chunks, "Generation failed mid-stream");
                        this.finish(epoch, GenerationState::Failed);
                        yield event;
                        return;
                    }
                    StreamEvent::Done { final_text, sources, usage } => {
                        let Some(index) = this.commit(section, provider, &request, &final_text, usage).await else {
                            break;
                        };
                        tracing::info!(
                            request_id = %request_id,
                            section = %section,
                            index,
                            chunks,
                            sources = sources.len(),
                            "Committed generation"
                        );
                        this.lock().last_commit = Some((section, index));
                        this.finish(epoch, GenerationState::Committed);
                        yield StreamEvent::Done { final_text, sources, usage };
                        return;
                    }
                }
            }

            if cancel.is_cancelled() {
                tracing::info!(request_id = %request_id, chunks, "Generation cancelled");
                this.finish(epoch, GenerationState::Cancelled);
            } else {
                let e = GenerationError::mid_stream("The provider closed the stream without a result.");
                this.finish(epoch, GenerationState::Failed);
                yield StreamEvent::from_error(&e);
            }
        })
    }

    /// Append the final text unless the generation was cancelled meanwhile.
    async fn commit(
        &self,
        section: ArtifactSection,
        provider: ProviderKind,
        request: &GenerationRequest,
        final_text: &str,
        reported: Option<UsageReport>,
    ) -> Option<usize> {
        let index = {
            let mut store = self.store.lock().await;
            if request.cancel.is_cancelled() {
                return None;
            }
            store.append(section, final_text)
        };

        let (input, output) = match reported {
            Some(u) => (u.input_tokens, u.output_tokens),
            None => {
                let prompt_chars = request.system_instruction.as_deref().unwrap_or_default().to_owned()
                    + &request.prompt;
                (self.estimator.estimate(&prompt_chars), self.estimator.estimate(final_text))
            }
        };
        if let Ok(adapter) = self.registry.get(provider) {
            let descriptor = adapter.descriptor();
            let grounded = request.grounding_enabled && descriptor.capabilities.grounding;
            self.usage.lock().await.record(
                input,
                output,
                grounded,
                &descriptor.model_info(&request.model_id),
                descriptor.grounding_fee,
            );
        }
        Some(index)
    }

    /// Drive a generation to its end, passing every event to `on_event`.
    pub async fn run<F>(
        &self,
        section: ArtifactSection,
        provider: ProviderKind,
        request: GenerationRequest,
        mut on_event: F,
    ) -> GenerationOutcome
    where
        F: FnMut(&StreamEvent),
    {
        let mut stream = self.generate(section, provider, request);
        let mut partial_text = String::new();

        while let Some(event) = stream.next().await {
            on_event(&event);
            match &event {
                StreamEvent::Chunk { text } => partial_text.push_str(text),
                StreamEvent::Status { .. } => {}
                StreamEvent::Error { .. } => {
                    if let Some(err) = event.as_error() {
                        return GenerationOutcome::Failed(err);
                    }
                }
                StreamEvent::Done { .. } => {
                    if let Some((_, index)) = self.last_commit() {
                        return GenerationOutcome::Committed { index };
                    }
                }
            }
        }

        GenerationOutcome::Cancelled { partial_text }
    }

    /// Commit a manual edit as a new version. Returns its index.
    pub async fn commit_manual(&self, section: ArtifactSection, content: impl Into<String>) -> usize {
        let index = self.store.lock().await.append(section, content);
        tracing::info!(section = %section, index, "Committed manual edit");
        index
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::llm::ProviderDescriptor;

    #[derive(Clone, Copy)]
    enum Script {
        HelloWorld,
        Unauthorized,
        FlakyThenHello,
        AlwaysReset,
        Stall,
    }

    struct ScriptedAdapter {
        descriptor: ProviderDescriptor,
        script: Script,
        connects: AtomicU32,
    }

    fn events(texts: &[&str]) -> Vec<StreamEvent> {
        let mut out: Vec<StreamEvent> = texts
            .iter()
            .map(|t| StreamEvent::Chunk { text: (*t).to_string() })
            .collect();
        out.push(StreamEvent::Done {
            final_text: texts.concat(),
            sources: Vec::new(),
            usage: Some(UsageReport { input_tokens: 5, output_tokens: 2 }),
        });
        out
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn connect(&self, _request: &GenerationRequest) -> Result<EventStream> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script {
                Script::HelloWorld => Ok(Box::pin(futures::stream::iter(events(&["Hello", " world"])))),
                Script::Unauthorized => Err(GenerationError::new(ErrorKind::Authorization, "Invalid API key.")),
                Script::FlakyThenHello if attempt == 1 => Err(GenerationError::transport("connection reset")),
                Script::AlwaysReset => Err(GenerationError::transport("connection reset")),
                Script::FlakyThenHello => Ok(Box::pin(futures::stream::iter(events(&["Hello"])))),
                Script::Stall => Ok(Box::pin(
                    futures::stream::iter(vec![StreamEvent::Chunk { text: "Hel".into() }])
                        .chain(futures::stream::pending()),
                )),
            }
        }
    }

    fn coordinator(script: Script) -> GenerationCoordinator {
        let mut registry = ProviderRegistry::new();
        registry.insert(Arc::new(ScriptedAdapter {
            descriptor: ProviderKind::Groq.descriptor(),
            script,
            connects: AtomicU32::new(0),
        }));
        GenerationCoordinator::new(
            Arc::new(registry),
            Arc::new(AsyncMutex::new(ArtifactVersionStore::new())),
            Arc::new(AsyncMutex::new(TokenUsage::default())),
        )
        .with_retry_policy(RetryPolicy::default().with_jitter(0.0))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("Say hello", "llama-3.3-70b-versatile")
    }

    #[tokio::test]
    async fn test_streams_and_commits() {
        let coordinator = coordinator(Script::HelloWorld);
        let mut chunks = Vec::new();
        let outcome = coordinator
            .run(ArtifactSection::Research, ProviderKind::Groq, request(), |e| {
                if let StreamEvent::Chunk { text } = e {
                    chunks.push(text.clone());
                }
            })
            .await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert_eq!(chunks, ["Hello", " world"]);
        assert_eq!(coordinator.state(), GenerationState::Committed);

        let store = coordinator.store().lock().await;
        assert_eq!(store.current(ArtifactSection::Research).unwrap().content, "Hello world");
        drop(store);

        let usage = *coordinator.usage().lock().await;
        assert_eq!((usage.input, usage.output), (5, 2));
    }

    #[tokio::test]
    async fn test_failure_leaves_store_untouched() {
        let coordinator = coordinator(Script::Unauthorized);
        let outcome = coordinator
            .run(ArtifactSection::Requirements, ProviderKind::Groq, request(), |_| {})
            .await;

        let GenerationOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(coordinator.state(), GenerationState::Failed);
        assert!(coordinator.store().lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_notice_precedes_chunks() {
        let coordinator = coordinator(Script::FlakyThenHello);
        let events: Vec<StreamEvent> = coordinator
            .generate(ArtifactSection::Research, ProviderKind::Groq, request())
            .collect()
            .await;

        let StreamEvent::Status { message } = &events[0] else {
            panic!("expected status first, got {:?}", events[0]);
        };
        assert!(message.contains("attempt 2 of 3"));
        assert_eq!(events[1], StreamEvent::Chunk { text: "Hello".into() });
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_commits_nothing() {
        let coordinator = coordinator(Script::Stall);
        let handle = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(ArtifactSection::Research, ProviderKind::Groq, request(), |_| {})
                    .await
            })
        };

        while !coordinator.is_generating() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.cancel();
        coordinator.cancel();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, GenerationOutcome::Cancelled { partial_text: "Hel".into() });
        assert_eq!(coordinator.state(), GenerationState::Cancelled);
        assert!(coordinator.store().lock().await.is_empty());

        coordinator.cancel();
        assert_eq!(coordinator.state(), GenerationState::Cancelled);
    }

    #[tokio::test]
    async fn test_manual_commit_appends() {
        let coordinator = coordinator(Script::HelloWorld);
        coordinator
            .run(ArtifactSection::BuildPlan, ProviderKind::Groq, request(), |_| {})
            .await;
        let index = coordinator.commit_manual(ArtifactSection::BuildPlan, "edited").await;
        assert_eq!(index, 1);
        assert_eq!(coordinator.store().lock().await.len(ArtifactSection::BuildPlan), 2);
    }

    #[tokio::test]
    async fn test_dropped_stream_counts_as_cancelled() {
        let coordinator = coordinator(Script::Stall);
        let mut stream = coordinator.generate(ArtifactSection::Research, ProviderKind::Groq, request());
        assert_eq!(stream.next().await, Some(StreamEvent::Chunk { text: "Hel".into() }));
        assert!(coordinator.is_generating());

        drop(stream);
        assert_eq!(coordinator.state(), GenerationState::Cancelled);
        assert!(coordinator.store().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_yields_nothing() {
        let coordinator = coordinator(Script::HelloWorld);
        let req = request();
        req.cancel.cancel();
        let events: Vec<StreamEvent> = coordinator
            .generate(ArtifactSection::Research, ProviderKind::Groq, req)
            .collect()
            .await;
        assert!(events.is_empty());
        assert_eq!(coordinator.state(), GenerationState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_retry_notice_is_dropped_after_cancel() {
        let coordinator = coordinator(Script::AlwaysReset);
        let req = request();
        let token = req.cancel.clone();
        let mut stream = coordinator.generate(ArtifactSection::Research, ProviderKind::Groq, req);

        // First attempt fails and queues a notice, then backoff parks the stream.
        assert!(futures::poll!(stream.next()).is_pending());
        token.cancel();

        let after: Vec<StreamEvent> = stream.collect().await;
        assert!(after.is_empty(), "events after cancel: {after:?}");
        assert_eq!(coordinator.state(), GenerationState::Cancelled);
    }

    #[tokio::test]
    async fn test_try_generate_refuses_while_generating() {
        let coordinator = coordinator(Script::Stall);
        let mut first = coordinator
            .try_generate(ArtifactSection::Research, ProviderKind::Groq, request())
            .unwrap();
        assert_eq!(first.next().await, Some(StreamEvent::Chunk { text: "Hel".into() }));

        let Err(err) = coordinator.try_generate(ArtifactSection::Research, ProviderKind::Groq, request()) else {
            panic!("second generation was admitted");
        };
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        coordinator.cancel();
        drop(first);
        assert!(coordinator
            .try_generate(ArtifactSection::Research, ProviderKind::Groq, request())
            .is_ok());
    }

    #[test]
    fn test_try_generate_admits_one_of_many_racers() {
        let coordinator = coordinator(Script::Stall);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator
                        .try_generate(ArtifactSection::Research, ProviderKind::Groq, request())
                        .ok()
                })
            })
            .collect();
        let admitted: Vec<EventStream> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(admitted.len(), 1);
        assert!(coordinator.is_generating());
    }
}
