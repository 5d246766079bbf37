//! Settings sections. Durations are stored as milliseconds so the JSON file
//! stays human-editable; engine components convert them to `Duration`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChorusSettings {
    pub decision: DecisionSettings,
    pub scheduler: SchedulerSettings,
    pub stream: StreamSettings,
    pub retry: RetrySettings,
    pub provider: ProviderSettings,
    pub logging: LoggingSettings,
}

impl ChorusSettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = self.decision.engage_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(SettingsError::InvalidValue(format!(
                "decision.engageProbability must be within [0, 1], got {p}"
            )));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(SettingsError::InvalidValue(
                "scheduler.maxConcurrent must be at least 1".into(),
            ));
        }
        if self.stream.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.requestTimeoutMs must be positive".into(),
            ));
        }
        if self.provider.endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue("provider.endpoint is empty".into()));
        }
        Ok(())
    }
}

/// Inputs of the priority decision function.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecisionSettings {
    /// Minimum gap after an agent's last turn before it may speak unprompted.
    pub cooldown_ms: u64,
    pub base_delay_ms: u64,
    /// Extra delay per roster position.
    pub stagger_ms: u64,
    /// Upper bound of the uniform random delay added to every decision.
    pub jitter_ms: u64,
    /// Extra delay for agents flagged as deliberate.
    pub thinking_bonus_ms: u64,
    /// Chance that an unmentioned agent engages at all. 1.0 = always engaged.
    pub engage_probability: f64,
    /// Rounds of silence after which an agent gets a priority boost.
    pub silence_threshold: u32,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            cooldown_ms: 8_000,
            base_delay_ms: 2_000,
            stagger_ms: 500,
            jitter_ms: 1_000,
            thinking_bonus_ms: 2_000,
            engage_probability: 1.0,
            silence_threshold: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub pause_recheck_ms: u64,
    /// Reading pause inserted before the next queued agent is dispatched.
    pub inter_turn_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            pause_recheck_ms: 500,
            inter_turn_delay_ms: 8_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub request_timeout_ms: u64,
    /// Display cadence of the typing-pace buffer, per character.
    pub typing_cadence_ms: u64,
    pub empty_placeholder: String,
    pub timeout_placeholder: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            typing_cadence_ms: 30,
            empty_placeholder: "model did not respond".into(),
            timeout_placeholder: "request timed out".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub priority: u8,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 2_000,
            priority: 90,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api/chat".into(),
            api_key: None,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"chorus_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
