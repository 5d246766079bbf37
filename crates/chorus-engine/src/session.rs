use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use chorus_core::conversation::Agent;
use chorus_core::errors::StreamError;
use chorus_core::ids::AgentId;
use chorus_core::provider::{CompletionProvider, EventStream};
use chorus_core::stream::StreamEvent;
use chorus_core::wire::{ChatMessage, CompletionRequest};
use chorus_telemetry::MetricsRecorder;

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::typing::TypingBuffer;

/// Callbacks for one streamed turn.
pub trait StreamHandler: Send + Sync {
    /// Paced text as it should be displayed.
    fn on_token(&self, agent_id: &AgentId, token: &str);

    fn on_complete(&self, _output: &TurnOutput) {}

    fn on_error(&self, _agent_id: &AgentId, _error: &StreamError) {}
}

#[derive(Clone, Debug)]
pub enum StreamOutcome {
    Completed,
    /// Stopped by the caller. Not an error.
    Aborted,
    TimedOut,
    Errored(StreamError),
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::TimedOut => "timed_out",
            Self::Errored(_) => "errored",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn error(&self) -> Option<&StreamError> {
        match self {
            Self::Errored(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of one streamed turn. `text` is everything received, even if the
/// display had not caught up when the turn ended.
#[derive(Clone, Debug)]
pub struct TurnOutput {
    pub agent_id: AgentId,
    pub outcome: StreamOutcome,
    pub text: String,
    /// `text` is a synthesized placeholder rather than model output.
    pub placeholder: bool,
    pub elapsed: Duration,
}

impl TurnOutput {
    /// Placeholder-only and errored turns are worth another attempt; aborted
    /// ones never are.
    pub fn needs_retry(&self) -> bool {
        match self.outcome {
            StreamOutcome::Aborted => false,
            StreamOutcome::Errored(_) => true,
            StreamOutcome::Completed | StreamOutcome::TimedOut => self.placeholder,
        }
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    started_at: Instant,
    generation: u64,
}

/// Removes the registry entry on every exit path, unless a newer session for
/// the same agent has replaced it.
struct SessionGuard<'a> {
    sessions: &'a DashMap<AgentId, ActiveSession>,
    agent_id: AgentId,
    generation: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.sessions
            .remove_if(&self.agent_id, |_, s| s.generation == generation);
    }
}

enum Ending {
    Finished,
    TimedOut,
    Aborted,
    Failed(StreamError),
}

enum Wake {
    Cancelled,
    Deadline,
    Event(Option<StreamEvent>),
    Tick,
}

/// Owns every live completion stream, one per agent.
pub struct StreamSessionManager {
    provider: Arc<dyn CompletionProvider>,
    config: SessionConfig,
    sessions: DashMap<AgentId, ActiveSession>,
    next_generation: AtomicU64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl StreamSessionManager {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stream one turn for `agent`, relaying paced tokens to `handler`.
    ///
    /// Fails only if the agent already has a live session; every upstream
    /// failure is reported through the returned outcome.
    #[instrument(skip(self, agent, messages, handler), fields(agent_id = %agent.id, model = %agent.model))]
    pub async fn stream(
        &self,
        agent: &Agent,
        messages: Vec<ChatMessage>,
        handler: &dyn StreamHandler,
    ) -> Result<TurnOutput, EngineError> {
        let (cancel, _guard) = self.register(&agent.id)?;
        let started = Instant::now();
        let request = CompletionRequest::new(agent.model.clone(), messages);

        let deadline = tokio::time::sleep_until(started + self.config.request_timeout);
        tokio::pin!(deadline);

        let mut upstream: Option<EventStream> = None;
        let mut ending = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Ending::Aborted),
            _ = &mut deadline => Some(Ending::TimedOut),
            opened = self.provider.stream(&request) => match opened {
                Ok(stream) => {
                    upstream = Some(stream);
                    None
                }
                Err(e) => Some(Ending::Failed(e)),
            },
        };

        let mut text = String::new();
        let mut buffer = TypingBuffer::new(self.config.typing_cadence);
        let mut tick = tokio::time::interval(buffer.cadence().max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match &ending {
                // Natural ends let the display catch up; interruptions do not.
                Some(Ending::Finished | Ending::TimedOut) if buffer.is_empty() => break,
                Some(Ending::Aborted | Ending::Failed(_)) => break,
                _ => {}
            }

            let open = ending.is_none();
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = &mut deadline, if open => Wake::Deadline,
                event = next_event(&mut upstream), if open => Wake::Event(event),
                _ = tick.tick(), if !buffer.is_empty() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => ending = Some(Ending::Aborted),
                Wake::Deadline => {
                    upstream = None;
                    ending = Some(Ending::TimedOut);
                }
                Wake::Event(Some(StreamEvent::Delta { content })) => {
                    text.push_str(&content);
                    buffer.push(&content);
                }
                Wake::Event(Some(StreamEvent::Done) | None) => {
                    upstream = None;
                    ending = Some(Ending::Finished);
                }
                Wake::Event(Some(StreamEvent::Error { error })) => {
                    upstream = None;
                    ending = Some(Ending::Failed(error));
                }
                Wake::Tick => {
                    if let Some(c) = buffer.pop() {
                        let mut utf8 = [0u8; 4];
                        handler.on_token(&agent.id, c.encode_utf8(&mut utf8));
                    }
                }
            }
        }
        drop(upstream);
        if !buffer.is_empty() {
            debug!(undisplayed = buffer.pending(), "display cut short");
        }

        let (outcome, placeholder) = match ending {
            Some(Ending::Finished) | None => (StreamOutcome::Completed, false),
            Some(Ending::TimedOut) => (StreamOutcome::TimedOut, false),
            Some(Ending::Aborted) => (StreamOutcome::Aborted, false),
            // An error racing a caller abort is still an abort.
            Some(Ending::Failed(_)) if cancel.is_cancelled() => (StreamOutcome::Aborted, false),
            Some(Ending::Failed(e)) => (StreamOutcome::Errored(e), false),
        };

        let mut output = TurnOutput {
            agent_id: agent.id.clone(),
            outcome,
            text,
            placeholder,
            elapsed: Duration::ZERO,
        };

        if output.text.is_empty() {
            let filler = match output.outcome {
                StreamOutcome::Completed => Some(&self.config.empty_placeholder),
                StreamOutcome::TimedOut => Some(&self.config.timeout_placeholder),
                _ => None,
            };
            if let Some(filler) = filler {
                handler.on_token(&agent.id, filler);
                output.text = filler.clone();
                output.placeholder = true;
            }
        }
        output.elapsed = started.elapsed();

        self.record_outcome(&output);
        match &output.outcome {
            StreamOutcome::Errored(e) => {
                warn!(error_kind = e.error_kind(), error = %e, "stream failed");
                handler.on_error(&agent.id, e);
            }
            StreamOutcome::TimedOut => {
                warn!(timeout_ms = self.config.request_timeout.as_millis() as u64, "stream timed out");
                handler.on_complete(&output);
            }
            other => {
                debug!(outcome = other.as_str(), chars = output.text.chars().count(), "stream finished");
                handler.on_complete(&output);
            }
        }
        Ok(output)
    }

    /// Cancel one agent's live session.
    pub fn stop_stream(&self, agent_id: &AgentId) -> bool {
        if let Some((_, session)) = self.sessions.remove(agent_id) {
            session.cancel.cancel();
            debug!(
                agent_id = %agent_id,
                running_ms = session.started_at.elapsed().as_millis() as u64,
                "stream stopped"
            );
            true
        } else {
            false
        }
    }

    /// Cancel every live session and clear the registry.
    pub fn stop_all_streams(&self) -> usize {
        let count = self.sessions.len();
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
        self.sessions.clear();
        if count > 0 {
            debug!(count, "stopped all streams");
        }
        count
    }

    pub fn has_active_streams(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn register(&self, agent_id: &AgentId) -> Result<(CancellationToken, SessionGuard<'_>), EngineError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        match self.sessions.entry(agent_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyStreaming(agent_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveSession {
                    cancel: cancel.clone(),
                    started_at: Instant::now(),
                    generation,
                });
            }
        }
        Ok((
            cancel,
            SessionGuard {
                sessions: &self.sessions,
                agent_id: agent_id.clone(),
                generation,
            },
        ))
    }

    fn record_outcome(&self, output: &TurnOutput) {
        if let Some(m) = &self.metrics {
            m.counter_inc("stream.outcome", &[("outcome", output.outcome.as_str())], 1);
            m.histogram_observe("stream.duration_ms", &[], output.elapsed.as_millis() as f64);
        }
    }
}

async fn next_event(upstream: &mut Option<EventStream>) -> Option<StreamEvent> {
    match upstream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_llm::{MockProvider, MockResponse};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        tokens: Mutex<Vec<String>>,
        completed: Mutex<usize>,
        errors: Mutex<Vec<String>>,
    }

    impl Collector {
        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().clone()
        }
    }

    impl StreamHandler for Collector {
        fn on_token(&self, _agent_id: &AgentId, token: &str) {
            self.tokens.lock().push(token.to_string());
        }

        fn on_complete(&self, _output: &TurnOutput) {
            *self.completed.lock() += 1;
        }

        fn on_error(&self, _agent_id: &AgentId, error: &StreamError) {
            self.errors.lock().push(error.message());
        }
    }

    fn agent() -> Agent {
        Agent::new("Ada", "ada", "model-a").with_id(AgentId::from_raw("a"))
    }

    fn manager(responses: Vec<MockResponse>) -> Arc<StreamSessionManager> {
        let provider = Arc::new(MockProvider::new(responses));
        Arc::new(StreamSessionManager::new(provider, SessionConfig::default()))
    }

    fn prompt() -> Vec<ChatMessage> {
        vec![ChatMessage::user("Human: hi")]
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_are_paced_one_char_per_tick() {
        let manager = manager(vec![MockResponse::text("hello")]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();

        assert!(matches!(out.outcome, StreamOutcome::Completed));
        assert_eq!(out.text, "hello");
        assert!(!out.placeholder);
        assert_eq!(collector.tokens(), vec!["h", "e", "l", "l", "o"]);
        assert!(out.elapsed >= Duration::from_millis(120), "{:?}", out.elapsed);
        assert_eq!(*collector.completed.lock(), 1);
        assert!(!manager.has_active_streams());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_emits_single_placeholder() {
        let manager = manager(vec![MockResponse::empty()]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();

        assert!(matches!(out.outcome, StreamOutcome::Completed));
        assert_eq!(collector.tokens(), vec!["model did not respond"]);
        assert!(out.placeholder);
        assert!(out.needs_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_content_uses_timeout_placeholder() {
        let manager = manager(vec![MockResponse::Hang]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();

        assert!(matches!(out.outcome, StreamOutcome::TimedOut));
        assert_eq!(out.text, "request timed out");
        assert!(out.placeholder);
        assert!(out.needs_retry());
        assert!(out.elapsed >= Duration::from_secs(10));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_content_keeps_partial_text() {
        let manager = manager(vec![MockResponse::Stall(vec![StreamEvent::delta("abc")])]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();

        assert!(matches!(out.outcome, StreamOutcome::TimedOut));
        assert_eq!(out.text, "abc");
        assert!(!out.placeholder);
        assert!(!out.needs_retry());
        assert_eq!(collector.tokens().concat(), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_full_text_not_just_displayed() {
        let manager = manager(vec![MockResponse::text("hello world")]);
        let collector = Arc::new(Collector::default());

        let task = {
            let manager = manager.clone();
            let collector = collector.clone();
            tokio::spawn(async move { manager.stream(&agent(), prompt(), &*collector).await })
        };

        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(manager.stop_stream(&AgentId::from_raw("a")));

        let out = task.await.unwrap().unwrap();
        assert!(out.outcome.is_aborted());
        assert_eq!(out.text, "hello world");
        assert!(collector.tokens().len() < "hello world".len());
        assert!(!out.needs_retry());
        assert!(collector.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_is_errored_with_message() {
        let manager = manager(vec![MockResponse::stream_error(
            "part",
            StreamError::Upstream("boom".into()),
        )]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();

        match &out.outcome {
            StreamOutcome::Errored(StreamError::Upstream(m)) => assert_eq!(m, "boom"),
            other => panic!("expected Errored, got {other:?}"),
        }
        assert_eq!(out.text, "part");
        assert!(out.needs_retry());
        assert_eq!(*collector.errors.lock(), vec!["boom".to_string()]);
        assert_eq!(*collector.completed.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_errored() {
        let manager = manager(vec![MockResponse::Error(StreamError::Http {
            status: 502,
            message: "bad gateway".into(),
        })]);
        let collector = Collector::default();

        let out = manager.stream(&agent(), prompt(), &collector).await.unwrap();
        assert!(matches!(out.outcome, StreamOutcome::Errored(StreamError::Http { status: 502, .. })));
        assert!(collector.tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_with_pending_error_is_not_an_error() {
        let manager = manager(vec![MockResponse::delayed(
            Duration::from_millis(100),
            MockResponse::Error(StreamError::Network("reset".into())),
        )]);
        let collector = Arc::new(Collector::default());

        let task = {
            let manager = manager.clone();
            let collector = collector.clone();
            tokio::spawn(async move { manager.stream(&agent(), prompt(), &*collector).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop_all_streams();

        let out = task.await.unwrap().unwrap();
        assert!(out.outcome.is_aborted());
        assert!(collector.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_session_for_same_agent_is_rejected() {
        let manager = manager(vec![MockResponse::Hang]);
        let collector = Arc::new(Collector::default());

        let first = {
            let manager = manager.clone();
            let collector = collector.clone();
            tokio::spawn(async move { manager.stream(&agent(), prompt(), &*collector).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.has_active_streams());
        assert_eq!(manager.active_count(), 1);

        let second = manager.stream(&agent(), prompt(), &*collector).await;
        assert!(matches!(second, Err(EngineError::AlreadyStreaming(_))));

        assert_eq!(manager.stop_all_streams(), 1);
        assert!(first.await.unwrap().unwrap().outcome.is_aborted());
        assert!(!manager.has_active_streams());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_does_not_evict_replacement() {
        let provider = Arc::new(MockProvider::repeating(MockResponse::Hang));
        let manager = Arc::new(StreamSessionManager::new(provider, SessionConfig::default()));
        let collector = Arc::new(Collector::default());
        let spawn = |manager: Arc<StreamSessionManager>, collector: Arc<Collector>| {
            tokio::spawn(async move { manager.stream(&agent(), prompt(), &*collector).await })
        };

        let first = spawn(manager.clone(), collector.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.stop_stream(&AgentId::from_raw("a")));

        let second = spawn(manager.clone(), collector.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.await.unwrap().unwrap();
        assert_eq!(manager.active_count(), 1);

        manager.stop_all_streams();
        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_are_counted() {
        let metrics = Arc::new(MetricsRecorder::new());
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("ok"), MockResponse::empty()]));
        let manager = StreamSessionManager::new(provider, SessionConfig::default())
            .with_metrics(Some(metrics.clone()));
        let collector = Collector::default();

        manager.stream(&agent(), prompt(), &collector).await.unwrap();
        manager.stream(&agent(), prompt(), &collector).await.unwrap();

        assert_eq!(metrics.counter_get("stream.outcome", &[("outcome", "completed")]), 2);
        assert_eq!(metrics.histogram_summary("stream.duration_ms", &[]).count, 2);
    }
}
