use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult, EnvSource};
use crate::context::RunContext;
use crate::engine::EngineConfig;
use crate::execution::ProcessConfig;
use crate::hitl::HitlMode;
use crate::llm::{DEFAULT_API_BASE, OpenAiConfig, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub api_base: String,
    /// Name of the variable holding the API key; the key itself is never stored.
    pub api_key_env: String,
    pub max_rounds: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Retries for transient model errors (network, rate limit, 5xx).
    pub llm_max_retries: u32,
    pub code_timeout_secs: u64,
    pub malformed_retry_budget: u32,
    pub environment_restart_budget: u32,
    pub max_output_chars: usize,
    pub hitl: HitlMode,
    pub workspace: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_config: Option<PathBuf>,
    pub interpreter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            api_base: DEFAULT_API_BASE.into(),
            api_key_env: "OPENAI_API_KEY".into(),
            max_rounds: 30,
            max_tokens: 4096,
            temperature: 0.2,
            llm_max_retries: 3,
            code_timeout_secs: 300,
            malformed_retry_budget: 2,
            environment_restart_budget: 1,
            max_output_chars: 4000,
            hitl: HitlMode::None,
            workspace: PathBuf::from("./workspace"),
            tools_config: None,
            interpreter: "python3".into(),
        }
    }
}

impl Settings {
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&text)
    }

    /// Overlay values from the environment. Unset variables leave fields alone.
    pub fn apply_env(&mut self, env: &EnvSource) -> ConfigResult<()> {
        if let Some(v) = env.get("model")? {
            self.model = v;
        }
        if let Some(v) = env.get("api.base")? {
            self.api_base = v;
        }
        if let Some(v) = env.get("api.key.env")? {
            self.api_key_env = v;
        }
        if let Some(v) = env.parse("max.rounds")? {
            self.max_rounds = v;
        }
        if let Some(v) = env.parse("max.tokens")? {
            self.max_tokens = v;
        }
        if let Some(v) = env.parse("temperature")? {
            self.temperature = v;
        }
        if let Some(v) = env.parse("llm.max.retries")? {
            self.llm_max_retries = v;
        }
        if let Some(v) = env.parse("code.timeout")? {
            self.code_timeout_secs = v;
        }
        if let Some(v) = env.parse("hitl")? {
            self.hitl = v;
        }
        if let Some(v) = env.get("workspace")? {
            self.workspace = PathBuf::from(v);
        }
        if let Some(v) = env.get("tools.config")? {
            self.tools_config = Some(PathBuf::from(v));
        }
        if let Some(v) = env.get("interpreter")? {
            self.interpreter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.model.trim().is_empty() {
            errors.push(ConfigError::invalid("model", "must not be empty"));
        }
        if url::Url::parse(&self.api_base).is_err() {
            errors.push(ConfigError::invalid("api_base", "must be a valid URL"));
        }
        if self.max_rounds == 0 {
            errors.push(ConfigError::invalid("max_rounds", "must be at least 1"));
        }
        if self.max_tokens == 0 {
            errors.push(ConfigError::invalid("max_tokens", "must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push(ConfigError::invalid("temperature", "must be within 0.0..=2.0"));
        }
        if self.code_timeout_secs == 0 {
            errors.push(ConfigError::invalid("code_timeout_secs", "must be at least 1"));
        }
        if self.interpreter.trim().is_empty() {
            errors.push(ConfigError::invalid("interpreter", "must not be empty"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Validation(errors)),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_rounds(self.max_rounds)
            .with_code_timeout(Duration::from_secs(self.code_timeout_secs))
            .with_malformed_retry_budget(self.malformed_retry_budget)
            .with_environment_restart_budget(self.environment_restart_budget)
            .with_max_output_chars(self.max_output_chars)
            .with_hitl_mode(self.hitl)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }

    /// Model client settings. The API key is read from `api_key_env` if set.
    pub fn model_config(&self) -> OpenAiConfig {
        let config = OpenAiConfig::new(&self.model)
            .api_base(&self.api_base)
            .retry(RetryConfig::default().with_max_retries(self.llm_max_retries));
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => config.api_key(key),
            _ => {
                tracing::debug!(var = %self.api_key_env, "no API key in environment");
                config
            }
        }
    }

    /// Interpreter settings rooted in the run's data directory.
    pub fn process_config(&self, context: &RunContext) -> ProcessConfig {
        ProcessConfig::python(&context.data_path)
            .with_program(&self.interpreter)
            .with_artifact_dir(&context.artifacts_path)
    }
}
