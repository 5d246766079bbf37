use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Priority given to an agent that is explicitly mentioned.
pub const PRIORITY_MENTION: u8 = 100;
/// Floor for a retried turn.
pub const PRIORITY_RETRY: u8 = 90;
/// Floor when the triggering message came from the human.
pub const PRIORITY_HUMAN: u8 = 80;
/// Floor when the triggering message asks a question.
pub const PRIORITY_QUESTION: u8 = 70;
/// Floor for agents that have stayed silent for several rounds.
pub const PRIORITY_SILENT: u8 = 60;
/// Baseline for the always-engaged policy.
pub const PRIORITY_BASE: u8 = 50;

/// Outcome of evaluating one agent against one triggering message.
/// Ephemeral: produced, consumed, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDecision {
    pub should_respond: bool,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub priority: u8,
}

impl TurnDecision {
    pub fn skip() -> Self {
        Self {
            should_respond: false,
            delay: Duration::ZERO,
            priority: 0,
        }
    }

    pub fn respond(delay: Duration, priority: u8) -> Self {
        Self {
            should_respond: true,
            delay,
            priority,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
