use std::collections::HashMap;
use std::time::Duration;

use chorus_core::ids::AgentId;
use chorus_core::turn::PRIORITY_RETRY;

use crate::session::TurnOutput;

/// Bounded retry for turns that produced nothing usable.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub priority: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(2000),
            priority: PRIORITY_RETRY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry {
        attempt: u32,
        delay: Duration,
        priority: u8,
    },
    /// Keep whatever the turn produced.
    Accept,
}

impl RetryPolicy {
    /// Decide what to do with a finished turn, counting the attempt in `ledger`.
    /// Accepting a turn clears the agent's count.
    pub fn evaluate(&self, output: &TurnOutput, ledger: &mut RetryLedger) -> RetryVerdict {
        let agent_id = &output.agent_id;
        if output.needs_retry() && ledger.attempts(agent_id) < self.max_retries {
            let attempt = ledger.record_retry(agent_id);
            return RetryVerdict::Retry {
                attempt,
                delay: self.backoff,
                priority: self.priority,
            };
        }
        ledger.clear(agent_id);
        RetryVerdict::Accept
    }
}

/// Retries spent on each agent's current turn.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: HashMap<AgentId, u32>,
}

impl RetryLedger {
    pub fn attempts(&self, agent_id: &AgentId) -> u32 {
        self.attempts.get(agent_id).copied().unwrap_or(0)
    }

    fn record_retry(&mut self, agent_id: &AgentId) -> u32 {
        let n = self.attempts.entry(agent_id.clone()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn clear(&mut self, agent_id: &AgentId) {
        self.attempts.remove(agent_id);
    }

    pub fn clear_all(&mut self) {
        self.attempts.clear();
    }
}
