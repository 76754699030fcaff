use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execution::DEFAULT_EXECUTION_TIMEOUT;
use crate::hitl::HitlMode;

/// Stop sequences that end a response right after a code block or answer.
pub const DEFAULT_STOP_SEQUENCES: &[&str] = &["</code>", "</answer>"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_rounds: u32,
    #[serde(with = "duration_secs")]
    pub code_timeout: Duration,
    /// Consecutive malformed responses tolerated before the run fails.
    pub malformed_retry_budget: u32,
    /// Environment restarts allowed per run.
    pub environment_restart_budget: u32,
    /// Observation output beyond this many characters is truncated.
    pub max_output_chars: usize,
    pub hitl_mode: HitlMode,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 30,
            code_timeout: DEFAULT_EXECUTION_TIMEOUT,
            malformed_retry_budget: 2,
            environment_restart_budget: 1,
            max_output_chars: 4000,
            hitl_mode: HitlMode::None,
            temperature: Some(0.2),
            max_tokens: Some(4096),
            stop_sequences: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    pub fn with_malformed_retry_budget(mut self, budget: u32) -> Self {
        self.malformed_retry_budget = budget;
        self
    }

    pub fn with_environment_restart_budget(mut self, budget: u32) -> Self {
        self.environment_restart_budget = budget;
        self
    }

    pub fn with_max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }

    pub fn with_hitl_mode(mut self, mode: HitlMode) -> Self {
        self.hitl_mode = mode;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
