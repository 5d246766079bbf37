use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, trace};

use chorus_core::conversation::{Agent, Message, Roster};
use chorus_core::turn::{
    TurnDecision, PRIORITY_BASE, PRIORITY_HUMAN, PRIORITY_MENTION, PRIORITY_QUESTION,
    PRIORITY_SILENT,
};

use crate::config::DecisionConfig;
use crate::tracker::Tracker;

/// Decides whether, how soon and how urgently an agent answers a message.
pub struct DecisionPolicy {
    config: DecisionConfig,
    rng: StdRng,
    mention_patterns: HashMap<String, Option<Regex>>,
}

impl DecisionPolicy {
    pub fn new(config: DecisionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter and engagement rolls.
    pub fn seeded(config: DecisionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: DecisionConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            mention_patterns: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Evaluate `agent` against `trigger`.
    ///
    /// Every non-exempt evaluation counts toward the agent's silence counter,
    /// including ones that end in a skip. Exempt messages (the agent's own or
    /// a system notice) are not evaluations at all and leave the counter
    /// untouched.
    pub fn decide(
        &mut self,
        tracker: &mut Tracker,
        agent: &Agent,
        trigger: &Message,
        roster: &Roster,
        now: Instant,
    ) -> TurnDecision {
        if trigger.is_from(&agent.id) || trigger.is_system() {
            return TurnDecision::skip();
        }

        let mentioned = self.is_mentioned(&agent.tag, &trigger.text);
        let silent_rounds = tracker.silence(&agent.id);
        tracker.record_evaluation(&agent.id);

        if !mentioned && tracker.on_cooldown(&agent.id, now, self.config.cooldown) {
            trace!(agent_id = %agent.id, "on cooldown");
            return TurnDecision::skip();
        }

        let human = trigger.is_human();
        let question = trigger.is_question();
        if !mentioned && !(human && question) && !self.roll_engagement() {
            debug!(agent_id = %agent.id, "declined to engage");
            return TurnDecision::skip();
        }

        let mut priority = PRIORITY_BASE;
        if mentioned {
            priority = priority.max(PRIORITY_MENTION);
        }
        if human {
            priority = priority.max(PRIORITY_HUMAN);
        }
        if question {
            priority = priority.max(PRIORITY_QUESTION);
        }
        if silent_rounds >= self.config.silence_threshold {
            priority = priority.max(PRIORITY_SILENT);
        }

        let ordinal = roster.position(&agent.id).unwrap_or(agent.ordinal_index);
        let delay = self.delay_for(ordinal, agent.deliberate);
        debug!(
            agent_id = %agent.id,
            priority,
            delay_ms = delay.as_millis() as u64,
            mentioned,
            silent_rounds,
            "decided to respond"
        );
        TurnDecision::respond(delay, priority)
    }

    /// `@tag` preceded by start of text or a non-word character, ending on a
    /// word boundary. Case-insensitive.
    pub fn is_mentioned(&mut self, tag: &str, text: &str) -> bool {
        if tag.is_empty() {
            return false;
        }
        let key = tag.to_lowercase();
        let pattern = self.mention_patterns.entry(key).or_insert_with(|| {
            Regex::new(&format!(r"(?i)(?:^|[^\w@])@{}\b", regex::escape(tag))).ok()
        });
        pattern.as_ref().is_some_and(|re| re.is_match(text))
    }

    fn delay_for(&mut self, ordinal: usize, deliberate: bool) -> Duration {
        let stagger = self.config.stagger.saturating_mul(ordinal as u32);
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..jitter_ms))
        };
        let bonus = if deliberate {
            self.config.thinking_bonus
        } else {
            Duration::ZERO
        };
        self.config.base_delay + stagger + jitter + bonus
    }

    fn roll_engagement(&mut self) -> bool {
        let p = self.config.engage_probability;
        if p >= 1.0 {
            true
        } else if p <= 0.0 {
            false
        } else {
            self.rng.gen::<f64>() < p
        }
    }
}
