//! Runtime settings.
//!
//! ```rust,no_run
//! use datapilot::config::{EnvSource, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut settings = Settings::from_file("datapilot.json").await?;
//! settings.apply_env(&EnvSource::default())?;
//! settings.validate()?;
//! # Ok(())
//! # }
//! ```

mod env;
mod settings;

pub use env::{ENV_PREFIX, EnvSource};
pub use settings::Settings;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    msgs.join("; ")
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
