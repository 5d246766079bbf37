//! Reference wiring of scheduler, session manager and retry policy around a
//! shared transcript.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chorus_core::conversation::{Agent, Author, Message, Roster};
use chorus_core::errors::StreamError;
use chorus_core::ids::{AgentId, MessageId};
use chorus_core::provider::CompletionProvider;
use chorus_core::wire::ChatMessage;
use chorus_telemetry::MetricsRecorder;

use crate::config::EngineConfig;
use crate::decision::DecisionPolicy;
use crate::error::EngineError;
use crate::retry::{RetryLedger, RetryPolicy, RetryVerdict};
use crate::scheduler::{PauseFlag, SchedulerSnapshot, TurnScheduler};
use crate::session::{StreamHandler, StreamOutcome, StreamSessionManager, TurnOutput};

const EVENT_CAPACITY: usize = 1024;
const HUMAN_NAME: &str = "Human";

#[derive(Clone, Debug)]
pub enum ConversationEvent {
    MessagePosted(Message),
    TurnStarted {
        agent_id: AgentId,
    },
    /// Paced display text.
    Token {
        agent_id: AgentId,
        text: String,
    },
    TurnCompleted {
        agent_id: AgentId,
        outcome: StreamOutcome,
        /// Absent when an aborted turn produced nothing.
        message_id: Option<MessageId>,
    },
    /// The turn errored and retries are exhausted.
    TurnFailed {
        agent_id: AgentId,
        error: StreamError,
    },
    TurnRetrying {
        agent_id: AgentId,
        attempt: u32,
        delay: Duration,
    },
    Paused,
    Resumed,
    Stopped,
}

struct EventRelay<'a> {
    events: &'a broadcast::Sender<ConversationEvent>,
}

impl StreamHandler for EventRelay<'_> {
    fn on_token(&self, agent_id: &AgentId, token: &str) {
        let _ = self.events.send(ConversationEvent::Token {
            agent_id: agent_id.clone(),
            text: token.to_string(),
        });
    }
}

struct Shared {
    roster: RwLock<Roster>,
    transcript: RwLock<Vec<Message>>,
    scheduler: TurnScheduler,
    sessions: StreamSessionManager,
    retry: RetryPolicy,
    ledger: Mutex<RetryLedger>,
    paused: PauseFlag,
    /// Bumped on conversation switch so turns from the old feed are dropped.
    epoch: AtomicU64,
    events: broadcast::Sender<ConversationEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
}

/// One live multi-agent conversation.
pub struct Conversation {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl Conversation {
    /// Must be called from within a tokio runtime.
    pub fn new(
        roster: Roster,
        provider: Arc<dyn CompletionProvider>,
        config: EngineConfig,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let policy = DecisionPolicy::new(config.decision.clone());
        Self::with_policy(roster, provider, policy, config, metrics)
    }

    pub fn with_policy(
        roster: Roster,
        provider: Arc<dyn CompletionProvider>,
        policy: DecisionPolicy,
        config: EngineConfig,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let paused = PauseFlag::new();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<(AgentId, u64)>();
        let scheduler = TurnScheduler::builder(config.scheduler, policy)
            .pause_checker(paused.clone())
            .metrics(metrics.clone())
            .spawn(dispatch_tx);
        let sessions = StreamSessionManager::new(provider, config.session).with_metrics(metrics.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            roster: RwLock::new(roster),
            transcript: RwLock::new(Vec::new()),
            scheduler,
            sessions,
            retry: config.retry,
            ledger: Mutex::new(RetryLedger::default()),
            paused,
            epoch: AtomicU64::new(0),
            events,
            metrics,
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some((agent_id, round)) = dispatch_rx.recv().await {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.run_turn(agent_id, round).await });
                }
            })
        };

        Self { shared, dispatcher }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.events.subscribe()
    }

    /// Append a human message and let every agent weigh in.
    pub async fn post_human(&self, text: impl Into<String>) -> Message {
        let message = Message::human(text);
        self.shared.append(message.clone());
        if !self.shared.paused.get() {
            self.shared.run_decisions(&message).await;
        }
        message
    }

    /// Abort live turns and hold all dispatching until [`resume`](Self::resume).
    /// Turns already granted but not yet streaming are dropped too.
    pub fn pause(&self) {
        info!("pausing conversation");
        self.shared.paused.set(true);
        self.shared.scheduler.reset();
        self.shared.sessions.stop_all_streams();
        self.shared.send_event(ConversationEvent::Paused);
    }

    /// Lift the pause and re-run decisions for the latest message.
    pub async fn resume(&self) {
        info!("resuming conversation");
        self.shared.paused.set(false);
        self.shared.send_event(ConversationEvent::Resumed);
        let last = self.shared.transcript.read().last().cloned();
        if let Some(last) = last {
            self.shared.run_decisions(&last).await;
        }
    }

    /// Abort live turns and drop everything scheduled, including turns
    /// already granted but not yet streaming.
    pub fn stop(&self) {
        info!("stopping conversation");
        self.shared.scheduler.reset();
        self.shared.sessions.stop_all_streams();
        self.shared.ledger.lock().clear_all();
        self.shared.send_event(ConversationEvent::Stopped);
    }

    /// Stop and start over with an empty transcript and the same roster.
    pub fn switch_conversation(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop();
        self.shared.transcript.write().clear();
    }

    /// Returns false if an agent with the same id is already present.
    pub fn add_agent(&self, agent: Agent) -> bool {
        let name = agent.name.clone();
        if !self.shared.roster.write().push(agent) {
            return false;
        }
        self.shared.append(Message::system(format!("{name} joined the conversation")));
        true
    }

    pub fn remove_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        let removed = self.shared.roster.write().remove(agent_id)?;
        self.shared.sessions.stop_stream(agent_id);
        self.shared
            .append(Message::system(format!("{} left the conversation", removed.name)));
        Some(removed)
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.shared.transcript.read().clone()
    }

    pub fn roster(&self) -> Roster {
        self.shared.roster.read().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.get()
    }

    pub fn has_active_streams(&self) -> bool {
        self.shared.sessions.has_active_streams()
    }

    pub async fn status(&self) -> Result<SchedulerSnapshot, EngineError> {
        self.shared.scheduler.snapshot().await
    }

    /// Prompt the agent would be sent right now.
    pub fn prompt_for(&self, agent_id: &AgentId) -> Result<Vec<ChatMessage>, EngineError> {
        let agent = self
            .shared
            .roster
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.clone()))?;
        Ok(self.shared.build_prompt(&agent))
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.shared.sessions.stop_all_streams();
        self.shared.scheduler.shutdown();
    }
}

impl Shared {
    fn send_event(&self, event: ConversationEvent) {
        if self.events.send(event).is_err() {
            debug!("no conversation subscribers");
        }
    }

    fn append(&self, message: Message) {
        self.transcript.write().push(message.clone());
        self.send_event(ConversationEvent::MessagePosted(message));
    }

    async fn run_decisions(&self, trigger: &Message) {
        let roster = self.roster.read().clone();
        for agent in roster.iter() {
            match self.scheduler.decide(agent, trigger, &roster).await {
                Ok(d) if d.should_respond => {
                    self.scheduler
                        .queue_response(agent.id.clone(), d.delay, d.priority);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "decision round abandoned");
                    return;
                }
            }
        }
    }

    /// A reset since the grant means the turn was revoked.
    fn revoked(&self, round: u64) -> bool {
        self.scheduler.round() != round
    }

    async fn run_turn(&self, agent_id: AgentId, round: u64) {
        if self.revoked(round) || self.paused.get() {
            debug!(agent_id = %agent_id, "turn revoked before it started");
            self.scheduler.complete_response(agent_id);
            return;
        }
        let agent = self.roster.read().get(&agent_id).cloned();
        let Some(agent) = agent else {
            debug!(agent_id = %agent_id, "dispatched agent has left");
            self.scheduler.complete_response(agent_id);
            return;
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let prompt = self.build_prompt(&agent);
        self.send_event(ConversationEvent::TurnStarted {
            agent_id: agent_id.clone(),
        });

        let relay = EventRelay {
            events: &self.events,
        };
        let result = self.sessions.stream(&agent, prompt, &relay).await;
        self.scheduler.complete_response(agent_id.clone());

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "turn not started");
                return;
            }
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(agent_id = %agent_id, "dropping turn from previous conversation");
            return;
        }
        if self.revoked(round) {
            // Cut short by a stop or pause: keep the text, no retry, no replies.
            self.accept(output, false).await;
            return;
        }

        let verdict = self.retry.evaluate(&output, &mut self.ledger.lock());
        match verdict {
            RetryVerdict::Retry {
                attempt,
                delay,
                priority,
            } => {
                warn!(
                    agent_id = %agent_id,
                    attempt,
                    outcome = output.outcome.as_str(),
                    "retrying turn"
                );
                if let Some(m) = &self.metrics {
                    m.counter_inc("turn.retries", &[], 1);
                }
                self.send_event(ConversationEvent::TurnRetrying {
                    agent_id: agent_id.clone(),
                    attempt,
                    delay,
                });
                self.scheduler.force_queue_response(agent_id, delay, priority);
            }
            RetryVerdict::Accept => self.accept(output, true).await,
        }
    }

    async fn accept(&self, output: TurnOutput, follow_up: bool) {
        let TurnOutput {
            agent_id,
            outcome,
            text,
            ..
        } = output;

        let text = match &outcome {
            StreamOutcome::Errored(e) if text.is_empty() => format!("[error: {}]", e.message()),
            _ => text,
        };

        let posted = (!text.is_empty()).then(|| Message::from_agent(agent_id.clone(), text));
        if let Some(message) = &posted {
            self.append(message.clone());
        }
        if let StreamOutcome::Errored(error) = &outcome {
            self.send_event(ConversationEvent::TurnFailed {
                agent_id: agent_id.clone(),
                error: error.clone(),
            });
        }
        let aborted = outcome.is_aborted();
        self.send_event(ConversationEvent::TurnCompleted {
            agent_id,
            outcome,
            message_id: posted.as_ref().map(|m| m.id.clone()),
        });

        if let Some(message) = posted {
            if follow_up && !aborted && !self.paused.get() {
                self.run_decisions(&message).await;
            }
        }
    }

    fn build_prompt(&self, agent: &Agent) -> Vec<ChatMessage> {
        let transcript = self.transcript.read().clone();
        let roster = self.roster.read();

        let mut prompt = Vec::with_capacity(transcript.len() + 1);
        if let Some(persona) = &agent.persona {
            prompt.push(ChatMessage::system(persona.clone()));
        }
        for message in transcript {
            prompt.push(match &message.author {
                Author::System => ChatMessage::system(message.text),
                Author::Human => ChatMessage::user(format!("{HUMAN_NAME}: {}", message.text)),
                Author::Agent(id) if id == &agent.id => ChatMessage::assistant(message.text),
                Author::Agent(id) => {
                    let name = roster.get(id).map_or("Agent", |a| a.name.as_str());
                    ChatMessage::user(format!("{name}: {}", message.text))
                }
            });
        }
        prompt
    }
}
