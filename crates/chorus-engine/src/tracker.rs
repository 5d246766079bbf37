use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use chorus_core::ids::AgentId;

/// Per-agent cooldown and silence bookkeeping.
#[derive(Debug, Default)]
pub struct Tracker {
    last_response: HashMap<AgentId, Instant>,
    silence: HashMap<AgentId, u32>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The agent finished a turn: stamp it and zero its silence counter.
    pub fn record_response(&mut self, agent_id: &AgentId, at: Instant) {
        self.last_response.insert(agent_id.clone(), at);
        self.silence.insert(agent_id.clone(), 0);
    }

    /// Count one more round evaluated for this agent. Returns the new count.
    pub fn record_evaluation(&mut self, agent_id: &AgentId) -> u32 {
        let count = self.silence.entry(agent_id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn silence(&self, agent_id: &AgentId) -> u32 {
        self.silence.get(agent_id).copied().unwrap_or(0)
    }

    pub fn last_response(&self, agent_id: &AgentId) -> Option<Instant> {
        self.last_response.get(agent_id).copied()
    }

    pub fn on_cooldown(&self, agent_id: &AgentId, now: Instant, window: Duration) -> bool {
        self.last_response(agent_id)
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    pub fn clear_cooldown(&mut self, agent_id: &AgentId) {
        self.last_response.remove(agent_id);
    }

    pub fn clear(&mut self) {
        self.last_response.clear();
        self.silence.clear();
    }

    /// Silence counters, sorted by agent id.
    pub fn silence_counts(&self) -> Vec<(AgentId, u32)> {
        let mut counts: Vec<_> = self.silence.iter().map(|(k, v)| (k.clone(), *v)).collect();
        counts.sort();
        counts
    }
}
