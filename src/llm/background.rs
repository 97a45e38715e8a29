//! Create-then-poll driver for server-side generation tasks.
//!
//! Deep-research models do not stream. The provider accepts a task, hands
//! back an id, and the client polls until the task reaches a terminal state.
//! [`run_background_task`] turns that loop into the same [`EventStream`] the
//! streaming adapters produce, with elapsed-time `Status` events between
//! polls.
//!
//! Two ceilings bound the loop: consecutive poll transport failures (we lost
//! the ability to observe the task) and total wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::GenerationRequest;
use super::citations::CitationSet;
use crate::error::{ErrorKind, GenerationError, Result};
use crate::normalized::{EventStream, SourceCitation, StreamEvent, UsageReport};

/// Provider side of a background task.
#[async_trait::async_trait]
pub trait BackgroundTaskApi: Send + Sync {
    /// Submit the task and return its opaque id.
    async fn create(&self, request: &GenerationRequest) -> Result<String>;

    /// Fetch the task's current state.
    async fn poll(&self, task_id: &str, cancel: &CancellationToken) -> Result<TaskSnapshot>;

    /// Ask the server to stop the task. Best effort.
    async fn cancel(&self, task_id: &str) -> Result<()>;

    /// Label used in elapsed-time status lines.
    fn phase_label(&self) -> &str {
        "Researching"
    }

    /// Provider's preferred wait between polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Coarse task state, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Map a provider status string. Unknown values keep the task pending.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" => Self::Succeeded,
            "failed" | "incomplete" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            "queued" | "in_progress" | "pending" | "running" | "unspecified" => Self::Pending,
            other => {
                tracing::debug!(status = other, "Unrecognized task status, still waiting");
                Self::Pending
            }
        }
    }
}

/// One poll result.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSnapshot {
    Pending {
        status: String,
    },
    Succeeded {
        text: String,
        sources: Vec<SourceCitation>,
        usage: Option<UsageReport>,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// Poll loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Overrides the provider's interval when set.
    #[serde(with = "opt_secs")]
    pub poll_interval: Option<Duration>,
    pub max_consecutive_failures: u32,
    #[serde(with = "secs")]
    pub max_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: None,
            max_consecutive_failures: 5,
            max_duration: Duration::from_secs(60 * 60),
        }
    }
}

/// Format the elapsed-time status line, e.g. `"Researching... (2m 5s elapsed)"`.
#[must_use]
pub fn elapsed_status(phase: &str, elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{phase}... ({}m {}s elapsed)", secs / 60, secs % 60)
}

/// Drive a background task to completion as an event stream.
///
/// Polls immediately after creation, then sleeps between polls. A server-side
/// cancellation fires `request.cancel` and ends the stream with no terminal
/// event, the same as a local abort. A local abort asks the server to cancel
/// the task in the background.
pub fn run_background_task(
    api: Arc<dyn BackgroundTaskApi>,
    request: GenerationRequest,
    config: PollerConfig,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let cancel = request.cancel.clone();
        let started = Instant::now();
        let interval = config.poll_interval.unwrap_or_else(|| api.poll_interval());
        let phase = api.phase_label().to_string();

        yield StreamEvent::status(format!("Starting {}...", phase.to_lowercase()));

        let created = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            created = api.create(&request) => created,
        };
        let task_id = match created {
            Ok(id) => id,
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!(error = %e, kind = %e.kind(), "Failed to create background task");
                yield StreamEvent::from_error(&e);
                return;
            }
        };
        tracing::info!(task_id = %task_id, model = %request.model_id, "Background task created");

        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                cancel_remote(&api, &task_id);
                return;
            }
            if started.elapsed() >= config.max_duration {
                tracing::warn!(task_id = %task_id, "Background task exceeded its time limit");
                cancel_remote(&api, &task_id);
                yield StreamEvent::from_error(&GenerationError::new(
                    ErrorKind::Timeout,
                    format!(
                        "The task did not finish within {} minutes.",
                        config.max_duration.as_secs() / 60
                    ),
                ));
                return;
            }

            let polled = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    cancel_remote(&api, &task_id);
                    return;
                }
                polled = api.poll(&task_id, &cancel) => polled,
            };

            match polled {
                Ok(TaskSnapshot::Pending { status }) => {
                    failures = 0;
                    tracing::debug!(task_id = %task_id, status = %status, "Task still running");
                    yield StreamEvent::status(elapsed_status(&phase, started.elapsed()));
                }
                Ok(TaskSnapshot::Succeeded { text, sources, usage }) => {
                    tracing::info!(
                        task_id = %task_id,
                        elapsed_secs = started.elapsed().as_secs(),
                        text_len = text.len(),
                        "Background task completed"
                    );
                    let mut set = CitationSet::default();
                    set.extend(sources);
                    let sources = set.or_markdown_fallback(&text);
                    yield StreamEvent::Done { final_text: text, sources, usage };
                    return;
                }
                Ok(TaskSnapshot::Failed { reason }) => {
                    tracing::warn!(task_id = %task_id, reason = %reason, "Background task failed");
                    yield StreamEvent::from_error(&GenerationError::task_failed(reason));
                    return;
                }
                Ok(TaskSnapshot::Cancelled) => {
                    tracing::info!(task_id = %task_id, "Background task cancelled by the server");
                    cancel.cancel();
                    return;
                }
                Err(e) if e.is_aborted() || cancel.is_cancelled() => {
                    cancel_remote(&api, &task_id);
                    return;
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    tracing::warn!(
                        task_id = %task_id,
                        failures,
                        error = %e,
                        "Poll request failed"
                    );
                    if failures >= config.max_consecutive_failures {
                        yield StreamEvent::from_error(&GenerationError::transport(format!(
                            "Lost connection to the running task after {failures} failed status checks."
                        )));
                        return;
                    }
                }
                Err(e) => {
                    yield StreamEvent::from_error(&e);
                    return;
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    cancel_remote(&api, &task_id);
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    })
}

fn cancel_remote(api: &Arc<dyn BackgroundTaskApi>, task_id: &str) {
    let api = Arc::clone(api);
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = api.cancel(&task_id).await {
            tracing::debug!(task_id = %task_id, error = %e, "Server-side cancel failed");
        }
    });
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|s| s.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::StreamExt;

    use super::*;

    struct ScriptedTask {
        script: Mutex<VecDeque<Result<TaskSnapshot>>>,
        polls: AtomicU32,
        cancels: AtomicU32,
    }

    impl ScriptedTask {
        fn new(script: Vec<Result<TaskSnapshot>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                polls: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl BackgroundTaskApi for ScriptedTask {
        async fn create(&self, _request: &GenerationRequest) -> Result<String> {
            Ok("task-1".into())
        }

        async fn poll(&self, _task_id: &str, _cancel: &CancellationToken) -> Result<TaskSnapshot> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(pending("in_progress")))
        }

        async fn cancel(&self, _task_id: &str) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    fn pending(status: &str) -> TaskSnapshot {
        TaskSnapshot::Pending { status: status.into() }
    }

    async fn collect(api: Arc<ScriptedTask>, config: PollerConfig) -> (Vec<StreamEvent>, Duration) {
        let started = Instant::now();
        let request = GenerationRequest::new("research", "deep-research-pro-preview-12-2025");
        let events = run_background_task(api, request, config).collect::<Vec<_>>().await;
        (events, started.elapsed())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(TaskStatus::parse("queued"), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("IN_PROGRESS"), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("unspecified"), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("completed"), TaskStatus::Succeeded);
        assert_eq!(TaskStatus::parse("incomplete"), TaskStatus::Failed);
        assert_eq!(TaskStatus::parse("canceled"), TaskStatus::Cancelled);
        assert_eq!(TaskStatus::parse("requires_action"), TaskStatus::Pending);
    }

    #[test]
    fn test_elapsed_format() {
        assert_eq!(
            elapsed_status("Researching", Duration::from_secs(125)),
            "Researching... (2m 5s elapsed)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_two_intervals() {
        let api = ScriptedTask::new(vec![
            Ok(pending("in_progress")),
            Ok(pending("in_progress")),
            Ok(TaskSnapshot::Succeeded {
                text: "Done".into(),
                sources: Vec::new(),
                usage: None,
            }),
        ]);
        let (events, elapsed) = collect(Arc::clone(&api), PollerConfig::default()).await;

        assert_eq!(elapsed, Duration::from_secs(10));
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
        let statuses = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Status { .. }))
            .count();
        assert_eq!(statuses, 3);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done {
                final_text: "Done".into(),
                sources: Vec::new(),
                usage: None,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_poll_does_not_sleep() {
        let api = ScriptedTask::new(vec![Ok(TaskSnapshot::Failed {
            reason: "quota exceeded".into(),
        })]);
        let (events, elapsed) = collect(api, PollerConfig::default()).await;

        assert_eq!(elapsed, Duration::ZERO);
        let err = events.last().and_then(StreamEvent::as_error).unwrap();
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert_eq!(err.message(), "quota exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_hit_ceiling() {
        let api = ScriptedTask::new(vec![
            Err(GenerationError::transport("reset")),
            Ok(pending("running")),
            Err(GenerationError::transport("reset")),
            Err(GenerationError::transport("reset")),
            Err(GenerationError::transport("reset")),
        ]);
        let config = PollerConfig {
            max_consecutive_failures: 3,
            ..PollerConfig::default()
        };
        let (events, _) = collect(Arc::clone(&api), config).await;

        assert_eq!(api.polls.load(Ordering::SeqCst), 5);
        let err = events.last().and_then(StreamEvent::as_error).unwrap();
        assert_eq!(err.kind(), ErrorKind::TransientTransport);
        assert!(err.message().contains("Lost connection"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_ceiling() {
        let api = ScriptedTask::new(Vec::new());
        let config = PollerConfig {
            max_duration: Duration::from_secs(60),
            ..PollerConfig::default()
        };
        let (events, elapsed) = collect(api, config).await;

        assert_eq!(elapsed, Duration::from_secs(60));
        let err = events.last().and_then(StreamEvent::as_error).unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_cancel_is_abort() {
        let api = ScriptedTask::new(vec![Ok(TaskSnapshot::Cancelled)]);
        let request = GenerationRequest::new("research", "o3-deep-research");
        let token = request.cancel.clone();
        let events = run_background_task(api, request, PollerConfig::default())
            .collect::<Vec<_>>()
            .await;

        assert!(token.is_cancelled());
        assert!(events.iter().all(|e| !e.is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_abort_cancels_remote_task() {
        let api = ScriptedTask::new(Vec::new());
        let request = GenerationRequest::new("research", "o3-deep-research");
        let token = request.cancel.clone();
        let mut stream = run_background_task(
            Arc::clone(&api) as Arc<dyn BackgroundTaskApi>,
            request,
            PollerConfig::default(),
        );

        // starting status, then the first pending status
        assert!(matches!(stream.next().await, Some(StreamEvent::Status { .. })));
        assert!(matches!(stream.next().await, Some(StreamEvent::Status { .. })));
        token.cancel();
        assert!(stream.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.cancels.load(Ordering::SeqCst), 1);
    }
}
