use std::time::Duration;

use chorus_settings::ChorusSettings;

use crate::retry::RetryPolicy;

/// Tunables for the priority decision function.
#[derive(Clone, Debug)]
pub struct DecisionConfig {
    /// Minimum gap after a completed turn before an unmentioned agent may speak.
    pub cooldown: Duration,
    pub base_delay: Duration,
    /// Extra delay per roster position.
    pub stagger: Duration,
    /// Upper bound of the uniform random delay.
    pub jitter: Duration,
    /// Added for agents flagged as deliberate.
    pub thinking_bonus: Duration,
    /// Chance in `[0, 1]` of engaging when neither mentioned nor asked by the human.
    pub engage_probability: f64,
    /// Consecutive missed rounds after which an agent is boosted.
    pub silence_threshold: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(8000),
            base_delay: Duration::from_millis(2000),
            stagger: Duration::from_millis(500),
            jitter: Duration::from_millis(1000),
            thinking_bonus: Duration::from_millis(2000),
            engage_probability: 1.0,
            silence_threshold: 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// How often a paused timer re-checks the pause predicate.
    pub pause_recheck: Duration,
    /// Reading pause between one turn completing and the next queued agent starting.
    pub inter_turn_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            pause_recheck: Duration::from_millis(500),
            inter_turn_delay: Duration::from_millis(8000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for the upstream stream to reach a terminal event.
    pub request_timeout: Duration,
    /// Display time per character.
    pub typing_cadence: Duration,
    pub empty_placeholder: String,
    pub timeout_placeholder: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
            typing_cadence: Duration::from_millis(30),
            empty_placeholder: "model did not respond".into(),
            timeout_placeholder: "request timed out".into(),
        }
    }
}

/// Everything the engine needs, derived from [`ChorusSettings`].
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub decision: DecisionConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn from_settings(settings: &ChorusSettings) -> Self {
        let d = &settings.decision;
        let s = &settings.scheduler;
        let st = &settings.stream;
        let r = &settings.retry;
        Self {
            decision: DecisionConfig {
                cooldown: Duration::from_millis(d.cooldown_ms),
                base_delay: Duration::from_millis(d.base_delay_ms),
                stagger: Duration::from_millis(d.stagger_ms),
                jitter: Duration::from_millis(d.jitter_ms),
                thinking_bonus: Duration::from_millis(d.thinking_bonus_ms),
                engage_probability: d.engage_probability.clamp(0.0, 1.0),
                silence_threshold: d.silence_threshold,
            },
            scheduler: SchedulerConfig {
                max_concurrent: s.max_concurrent.max(1),
                pause_recheck: Duration::from_millis(s.pause_recheck_ms),
                inter_turn_delay: Duration::from_millis(s.inter_turn_delay_ms),
            },
            session: SessionConfig {
                request_timeout: Duration::from_millis(st.request_timeout_ms),
                typing_cadence: Duration::from_millis(st.typing_cadence_ms),
                empty_placeholder: st.empty_placeholder.clone(),
                timeout_placeholder: st.timeout_placeholder.clone(),
            },
            retry: RetryPolicy {
                max_retries: r.max_retries,
                backoff: Duration::from_millis(r.backoff_ms),
                priority: r.priority,
            },
        }
    }
}
