//! Environment variable overrides.
//!
//! Keys use dotted lowercase names (`max.rounds`) and map to prefixed
//! uppercase variables (`DATAPILOT_MAX_ROUNDS`).

use std::str::FromStr;

use super::{ConfigError, ConfigResult};

pub const ENV_PREFIX: &str = "DATAPILOT_";

/// Read-only view of prefixed environment variables.
#[derive(Debug, Clone)]
pub struct EnvSource {
    prefix: String,
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::prefixed(ENV_PREFIX)
    }
}

impl EnvSource {
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    pub fn get(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    /// Read and parse a variable, naming the key on failure.
    pub fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)?
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid(self.env_key(key), e.to_string()))
            })
            .transpose()
    }
}
