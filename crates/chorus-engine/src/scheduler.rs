//! Turn scheduler.
//!
//! A single owner task holds all scheduling state; [`TurnScheduler`] is a
//! cloneable handle that talks to it over a channel, so no two operations
//! ever interleave. Every delay is an entry in one `DelayQueue` keyed by
//! agent, which makes cancellation on reset structural.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, trace, warn};

use chorus_core::conversation::{Agent, Message, Roster};
use chorus_core::ids::AgentId;
use chorus_core::turn::TurnDecision;
use chorus_telemetry::MetricsRecorder;

use crate::config::SchedulerConfig;
use crate::decision::DecisionPolicy;
use crate::error::EngineError;
use crate::tracker::Tracker;

/// Receives an agent id each time the scheduler grants it the floor.
///
/// `round` is the number of resets applied before the grant. A turn whose
/// round is behind [`TurnScheduler::round`] was revoked by a later reset.
pub trait ResponseHandler: Send + Sync + 'static {
    fn dispatch(&self, agent_id: AgentId, round: u64);
}

impl ResponseHandler for mpsc::UnboundedSender<AgentId> {
    fn dispatch(&self, agent_id: AgentId, _round: u64) {
        if self.send(agent_id).is_err() {
            warn!("no dispatch receiver, turn dropped");
        }
    }
}

impl ResponseHandler for mpsc::UnboundedSender<(AgentId, u64)> {
    fn dispatch(&self, agent_id: AgentId, round: u64) {
        if self.send((agent_id, round)).is_err() {
            warn!("no dispatch receiver, turn dropped");
        }
    }
}

/// External pause predicate consulted whenever a timer fires.
pub trait PauseChecker: Send + Sync + 'static {
    fn is_paused(&self) -> bool;
}

impl<F> PauseChecker for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_paused(&self) -> bool {
        self()
    }
}

/// Shared pause switch.
#[derive(Clone, Debug, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl PauseChecker for PauseFlag {
    fn is_paused(&self) -> bool {
        self.get()
    }
}

/// Point-in-time view of scheduler state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub pending: Vec<AgentId>,
    /// Wait list in drain order.
    pub queued: Vec<(AgentId, u8)>,
    pub streaming: Vec<AgentId>,
    pub responding: usize,
    pub silence: Vec<(AgentId, u32)>,
    pub cooling_down: Vec<AgentId>,
}

impl SchedulerSnapshot {
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty() && self.streaming.is_empty()
    }

    pub fn silence_of(&self, agent_id: &AgentId) -> u32 {
        self.silence
            .iter()
            .find(|(id, _)| id == agent_id)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

enum Command {
    Decide {
        agent: Agent,
        trigger: Message,
        roster: Roster,
        reply: oneshot::Sender<TurnDecision>,
    },
    Queue {
        agent_id: AgentId,
        delay: Duration,
        priority: u8,
    },
    ForceQueue {
        agent_id: AgentId,
        delay: Duration,
        priority: u8,
    },
    Complete {
        agent_id: AgentId,
    },
    Reset,
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown,
}

/// Handle to the scheduler task.
#[derive(Clone)]
pub struct TurnScheduler {
    tx: mpsc::UnboundedSender<Command>,
    resets: Arc<AtomicU64>,
}

impl TurnScheduler {
    pub fn builder(config: SchedulerConfig, policy: DecisionPolicy) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            policy,
            pause: None,
            metrics: None,
        }
    }

    /// Evaluate one agent against a triggering message.
    pub async fn decide(
        &self,
        agent: &Agent,
        trigger: &Message,
        roster: &Roster,
    ) -> Result<TurnDecision, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Decide {
            agent: agent.clone(),
            trigger: trigger.clone(),
            roster: roster.clone(),
            reply,
        });
        rx.await.map_err(|_| EngineError::SchedulerClosed)
    }

    /// Arm a response timer unless the agent is already pending, queued or streaming.
    pub fn queue_response(&self, agent_id: AgentId, delay: Duration, priority: u8) {
        self.send(Command::Queue {
            agent_id,
            delay,
            priority,
        });
    }

    /// Retry path: forget cooldown and any pending or queued entry, then queue.
    pub fn force_queue_response(&self, agent_id: AgentId, delay: Duration, priority: u8) {
        self.send(Command::ForceQueue {
            agent_id,
            delay,
            priority,
        });
    }

    /// Report that an agent's turn ended, for any reason. Completions for
    /// agents that are not streaming (e.g. after [`reset`](Self::reset)) are
    /// ignored.
    pub fn complete_response(&self, agent_id: AgentId) {
        self.send(Command::Complete { agent_id });
    }

    /// Drop every timer, queue entry and streaming mark, and clear the
    /// tracker. Bumps [`round`](Self::round) before the task sees it.
    pub fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Reset);
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply });
        rx.await.map_err(|_| EngineError::SchedulerClosed)
    }

    /// Resets requested so far.
    pub fn round(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            warn!("scheduler task gone, command dropped");
        }
    }
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    policy: DecisionPolicy,
    pause: Option<Box<dyn PauseChecker>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SchedulerBuilder {
    pub fn pause_checker(mut self, pause: impl PauseChecker) -> Self {
        self.pause = Some(Box::new(pause));
        self
    }

    pub fn metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawn the owner task on the current runtime.
    pub fn spawn(self, handler: impl ResponseHandler) -> TurnScheduler {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SchedulerActor {
            config: self.config,
            policy: self.policy,
            tracker: Tracker::new(),
            pending: HashMap::new(),
            queue: Vec::new(),
            streaming: HashSet::new(),
            responding: 0,
            timers: DelayQueue::new(),
            handler: Box::new(handler),
            pause: self.pause.unwrap_or_else(|| Box::new(|| false)),
            metrics: self.metrics,
            round: 0,
        };
        tokio::spawn(actor.run(rx));
        TurnScheduler {
            tx,
            resets: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    /// Decision delay elapsed; try to take the floor.
    Dispatch,
    /// Reading pause after a completed turn; the slot is already held.
    Handoff,
}

#[derive(Debug)]
struct Timer {
    agent_id: AgentId,
    priority: u8,
    kind: TimerKind,
}

struct PendingTimer {
    key: delay_queue::Key,
    kind: TimerKind,
}

#[derive(Clone, Debug)]
struct QueueEntry {
    agent_id: AgentId,
    priority: u8,
}

enum Wake {
    Command(Option<Command>),
    Timer(Timer),
}

struct SchedulerActor {
    config: SchedulerConfig,
    policy: DecisionPolicy,
    tracker: Tracker,
    pending: HashMap<AgentId, PendingTimer>,
    queue: Vec<QueueEntry>,
    streaming: HashSet<AgentId>,
    responding: usize,
    timers: DelayQueue<Timer>,
    handler: Box<dyn ResponseHandler>,
    pause: Box<dyn PauseChecker>,
    metrics: Option<Arc<MetricsRecorder>>,
    /// Resets applied so far.
    round: u64,
}

impl SchedulerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wake = tokio::select! {
                cmd = rx.recv() => Wake::Command(cmd),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    Wake::Timer(expired.into_inner())
                }
            };
            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(cmd)) => self.handle(cmd),
                Wake::Timer(timer) => self.on_timer(timer),
            }
        }
        debug!("scheduler stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Decide {
                agent,
                trigger,
                roster,
                reply,
            } => {
                let decision =
                    self.policy
                        .decide(&mut self.tracker, &agent, &trigger, &roster, Instant::now());
                let _ = reply.send(decision);
            }
            Command::Queue {
                agent_id,
                delay,
                priority,
            } => self.queue_response(agent_id, delay, priority),
            Command::ForceQueue {
                agent_id,
                delay,
                priority,
            } => self.force_queue_response(agent_id, delay, priority),
            Command::Complete { agent_id } => self.complete_response(&agent_id),
            Command::Reset => self.reset(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn is_scheduled(&self, agent_id: &AgentId) -> bool {
        self.pending.contains_key(agent_id)
            || self.streaming.contains(agent_id)
            || self.queue.iter().any(|e| &e.agent_id == agent_id)
    }

    fn queue_response(&mut self, agent_id: AgentId, delay: Duration, priority: u8) {
        if self.is_scheduled(&agent_id) {
            trace!(agent_id = %agent_id, "already scheduled, ignoring");
            return;
        }
        debug!(agent_id = %agent_id, delay_ms = delay.as_millis() as u64, priority, "pending");
        self.arm(agent_id, delay, priority, TimerKind::Dispatch);
    }

    fn force_queue_response(&mut self, agent_id: AgentId, delay: Duration, priority: u8) {
        self.tracker.clear_cooldown(&agent_id);
        self.cancel_pending(&agent_id);
        self.remove_queued(&agent_id);
        self.queue_response(agent_id, delay, priority);
    }

    fn arm(&mut self, agent_id: AgentId, delay: Duration, priority: u8, kind: TimerKind) {
        let key = self.timers.insert(
            Timer {
                agent_id: agent_id.clone(),
                priority,
                kind,
            },
            delay,
        );
        self.pending.insert(agent_id, PendingTimer { key, kind });
    }

    fn cancel_pending(&mut self, agent_id: &AgentId) {
        if let Some(pending) = self.pending.remove(agent_id) {
            self.timers.remove(&pending.key);
            if pending.kind == TimerKind::Handoff {
                // The cancelled agent was holding a slot through its reading pause.
                self.release_slot();
            }
        }
    }

    fn remove_queued(&mut self, agent_id: &AgentId) {
        self.queue.retain(|e| &e.agent_id != agent_id);
        self.record_queue_depth();
    }

    fn on_timer(&mut self, timer: Timer) {
        let Timer {
            agent_id,
            priority,
            kind,
        } = timer;

        if self.pending.remove(&agent_id).is_none() {
            trace!(agent_id = %agent_id, "stale timer");
            return;
        }

        if self.pause.is_paused() {
            trace!(agent_id = %agent_id, "paused, rechecking later");
            self.arm(agent_id, self.config.pause_recheck, priority, kind);
            return;
        }

        match kind {
            TimerKind::Dispatch => self.try_dispatch(agent_id, priority),
            TimerKind::Handoff => {
                if self.streaming.is_empty() {
                    self.start_streaming(agent_id);
                } else {
                    // Someone took the floor during the reading pause.
                    self.responding = self.responding.saturating_sub(1);
                    self.enqueue(agent_id, priority);
                }
            }
        }
    }

    fn try_dispatch(&mut self, agent_id: AgentId, priority: u8) {
        if self.streaming.contains(&agent_id) {
            warn!(agent_id = %agent_id, "already streaming, dropping dispatch");
            return;
        }
        if !self.streaming.is_empty() || self.responding >= self.config.max_concurrent {
            self.enqueue(agent_id, priority);
            return;
        }
        self.responding += 1;
        self.start_streaming(agent_id);
    }

    fn start_streaming(&mut self, agent_id: AgentId) {
        let duplicate = self.streaming.contains(&agent_id);
        debug_assert!(!duplicate, "dispatching agent {agent_id} twice");
        if duplicate {
            error!(agent_id = %agent_id, "scheduler invariant violated: agent already streaming");
            return;
        }
        info!(agent_id = %agent_id, responding = self.responding, "dispatching turn");
        self.streaming.insert(agent_id.clone());
        if let Some(m) = &self.metrics {
            m.counter_inc("scheduler.dispatched", &[], 1);
        }
        self.handler.dispatch(agent_id, self.round);
    }

    /// Insert before the first entry of strictly lower priority, so ties keep
    /// arrival order.
    fn enqueue(&mut self, agent_id: AgentId, priority: u8) {
        if self.queue.iter().any(|e| e.agent_id == agent_id) {
            return;
        }
        let at = self
            .queue
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.queue.len());
        info!(agent_id = %agent_id, priority, position = at, "queued behind active speaker");
        self.queue.insert(at, QueueEntry { agent_id, priority });
        if let Some(m) = &self.metrics {
            m.counter_inc("scheduler.queued", &[], 1);
        }
        self.record_queue_depth();
    }

    fn complete_response(&mut self, agent_id: &AgentId) {
        // Turns dropped by a reset still report back; they must not leave a
        // cooldown behind.
        if !self.streaming.remove(agent_id) {
            debug!(agent_id = %agent_id, "ignoring completion for agent not streaming");
            return;
        }
        self.tracker.record_response(agent_id, Instant::now());
        self.cancel_pending(agent_id);
        self.remove_queued(agent_id);
        debug!(agent_id = %agent_id, "turn complete");
        self.release_slot();
    }

    /// Hand the freed slot to the best queued agent after the reading pause,
    /// or give it back.
    fn release_slot(&mut self) {
        if !self.queue.is_empty() && !self.pause.is_paused() {
            let next = self.queue.remove(0);
            self.record_queue_depth();
            debug!(
                agent_id = %next.agent_id,
                delay_ms = self.config.inter_turn_delay.as_millis() as u64,
                "handing off after reading pause"
            );
            self.arm(
                next.agent_id,
                self.config.inter_turn_delay,
                next.priority,
                TimerKind::Handoff,
            );
        } else {
            self.responding = self.responding.saturating_sub(1);
        }
    }

    fn reset(&mut self) {
        info!(
            pending = self.pending.len(),
            queued = self.queue.len(),
            streaming = self.streaming.len(),
            "scheduler reset"
        );
        self.tracker.clear();
        self.pending.clear();
        self.timers.clear();
        self.queue.clear();
        self.streaming.clear();
        self.responding = 0;
        self.round += 1;
        self.record_queue_depth();
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let now = Instant::now();
        let mut pending: Vec<_> = self.pending.keys().cloned().collect();
        pending.sort();
        let mut streaming: Vec<_> = self.streaming.iter().cloned().collect();
        streaming.sort();
        let silence = self.tracker.silence_counts();
        let mut cooling_down: Vec<_> = silence
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| self.tracker.on_cooldown(id, now, self.policy.config().cooldown))
            .collect();
        cooling_down.sort();
        SchedulerSnapshot {
            pending,
            queued: self
                .queue
                .iter()
                .map(|e| (e.agent_id.clone(), e.priority))
                .collect(),
            streaming,
            responding: self.responding,
            silence,
            cooling_down,
        }
    }

    fn record_queue_depth(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set("scheduler.queue_depth", &[], self.queue.len() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionConfig;

    fn spawn() -> (TurnScheduler, mpsc::UnboundedReceiver<AgentId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = DecisionPolicy::new(DecisionConfig::default());
        let scheduler = TurnScheduler::builder(SchedulerConfig::default(), policy).spawn(tx);
        (scheduler, rx)
    }

    fn id(s: &str) -> AgentId {
        AgentId::from_raw(s)
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_after_delay() {
        let (scheduler, mut rx) = spawn();
        scheduler.queue_response(id("a"), Duration::from_millis(2000), 50);

        let snap = scheduler.snapshot().await.unwrap();
        assert_eq!(snap.pending, vec![id("a")]);

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());

        let start = Instant::now();
        assert_eq!(rx.recv().await, Some(id("a")));
        assert!(start.elapsed() <= Duration::from_millis(1));

        let snap = scheduler.snapshot().await.unwrap();
        assert_eq!(snap.streaming, vec![id("a")]);
        assert_eq!(snap.responding, 1);
        assert!(snap.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_without_queue_frees_slot() {
        let (scheduler, mut rx) = spawn();
        scheduler.queue_response(id("a"), Duration::ZERO, 50);
        assert_eq!(rx.recv().await, Some(id("a")));

        scheduler.complete_response(id("a"));
        let snap = scheduler.snapshot().await.unwrap();
        assert!(snap.is_idle());
        assert_eq!(snap.responding, 0);
        assert_eq!(snap.cooling_down, vec![id("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_after_reset_leaves_no_cooldown() {
        let (scheduler, mut rx) = spawn();
        scheduler.queue_response(id("a"), Duration::ZERO, 50);
        assert_eq!(rx.recv().await, Some(id("a")));

        scheduler.reset();
        scheduler.complete_response(id("a"));
        scheduler.complete_response(id("ghost"));
        assert_eq!(scheduler.snapshot().await.unwrap(), SchedulerSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn force_queue_replaces_pending_timer() {
        let (scheduler, mut rx) = spawn();
        scheduler.queue_response(id("a"), Duration::from_secs(60), 50);
        scheduler.force_queue_response(id("a"), Duration::from_millis(100), 90);

        let start = Instant::now();
        assert_eq!(rx.recv().await, Some(id("a")));
        assert!(start.elapsed() < Duration::from_secs(1));

        // The original 60s timer was cancelled.
        scheduler.complete_response(id("a"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_handle() {
        let (scheduler, _rx) = spawn();
        scheduler.shutdown();
        assert!(matches!(
            scheduler.snapshot().await,
            Err(EngineError::SchedulerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_carries_reset_round() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(AgentId, u64)>();
        let policy = DecisionPolicy::new(DecisionConfig::default());
        let scheduler = TurnScheduler::builder(SchedulerConfig::default(), policy).spawn(tx);

        scheduler.queue_response(id("a"), Duration::ZERO, 50);
        assert_eq!(rx.recv().await, Some((id("a"), 0)));

        scheduler.reset();
        assert_eq!(scheduler.round(), 1);
        scheduler.queue_response(id("a"), Duration::ZERO, 50);
        assert_eq!(rx.recv().await, Some((id("a"), 1)));
    }

    #[test]
    fn pause_flag_toggles() {
        let flag = PauseFlag::new();
        assert!(!flag.is_paused());
        let shared = flag.clone();
        shared.set(true);
        assert!(flag.is_paused());
    }
}
