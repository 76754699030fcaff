//! Tool server configuration.
//!
//! ```yaml
//! servers:
//!   search:
//!     transport: http
//!     url: http://localhost:8931/mcp
//!     headers:
//!       Authorization: "Bearer ${SEARCH_TOKEN}"
//!   files:
//!     transport: stdio
//!     command: npx
//!     args: ["-y", "@modelcontextprotocol/server-filesystem", "${WORKSPACE:-.}"]
//!     enabled: false
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references are resolved when the file is
//! loaded. A reference to an unset variable without a default is an error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::CALL_TIMEOUT;

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var regex")
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ToolConfigError {
    #[error("failed to read tool config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tool config: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("server '{server}': environment variable '{var}' is not set")]
    MissingVariable { server: String, var: String },

    #[error("server '{server}': {message}")]
    Invalid { server: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

fn enabled_default() -> bool {
    true
}

/// One server as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerEntry {
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// The server tolerates overlapping calls.
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolServersConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ToolServerEntry>,
}

/// Connection parameters after variable resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolServerSpec {
    pub name: String,
    pub transport: ServerTransport,
    pub enabled: bool,
    pub concurrent: bool,
    pub call_timeout: Duration,
}

impl ToolServerSpec {
    pub fn new(name: impl Into<String>, transport: ServerTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            concurrent: false,
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

fn substitute(
    server: &str,
    value: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ToolConfigError> {
    let mut missing = None;
    let resolved = var_regex().replace_all(value, |caps: &Captures| {
        let var = &caps[1];
        match (lookup(var), caps.get(2)) {
            (Some(v), _) => v,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ToolConfigError::MissingVariable {
            server: server.to_string(),
            var,
        }),
        None => Ok(resolved.into_owned()),
    }
}

fn substitute_map(
    server: &str,
    map: &HashMap<String, String>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<HashMap<String, String>, ToolConfigError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), substitute(server, v, lookup)?)))
        .collect()
}

impl ToolServerEntry {
    fn resolve(
        &self,
        name: &str,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<ToolServerSpec, ToolConfigError> {
        let invalid = |message: &str| ToolConfigError::Invalid {
            server: name.to_string(),
            message: message.to_string(),
        };

        let transport = match self.transport {
            Transport::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| invalid("stdio transport requires 'command'"))?;
                ServerTransport::Stdio {
                    command: substitute(name, command, lookup)?,
                    args: self
                        .args
                        .iter()
                        .map(|a| substitute(name, a, lookup))
                        .collect::<Result<_, _>>()?,
                    env: substitute_map(name, &self.env, lookup)?,
                    cwd: self
                        .cwd
                        .as_deref()
                        .map(|c| substitute(name, c, lookup))
                        .transpose()?,
                }
            }
            Transport::Http => {
                let raw = self
                    .url
                    .as_deref()
                    .ok_or_else(|| invalid("http transport requires 'url'"))?;
                let url = substitute(name, raw, lookup)?;
                match url::Url::parse(&url) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                    _ => return Err(invalid(&format!("invalid url '{url}'"))),
                }
                ServerTransport::Http {
                    url,
                    headers: substitute_map(name, &self.headers, lookup)?,
                }
            }
        };

        Ok(ToolServerSpec {
            name: name.to_string(),
            transport,
            enabled: self.enabled,
            concurrent: self.concurrent,
            call_timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(CALL_TIMEOUT),
        })
    }
}

impl ToolServersConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ToolConfigError> {
        Ok(serde_yaml_bw::from_str(text)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ToolConfigError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&text)
    }

    /// Resolve every server against the process environment.
    pub fn resolve(&self) -> Result<Vec<ToolServerSpec>, ToolConfigError> {
        self.resolve_with(|var| std::env::var(var).ok())
    }

    /// Resolve every server using `lookup` for variable references.
    ///
    /// Disabled servers are resolved leniently: a missing variable only
    /// matters for servers that will actually be started.
    pub fn resolve_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<ToolServerSpec>, ToolConfigError> {
        let mut specs = Vec::with_capacity(self.servers.len());
        for (name, entry) in &self.servers {
            if name.contains("__") || name.is_empty() {
                return Err(ToolConfigError::Invalid {
                    server: name.clone(),
                    message: "server names must be non-empty and must not contain '__'".into(),
                });
            }
            match entry.resolve(name, &lookup) {
                Ok(spec) => specs.push(spec),
                Err(ToolConfigError::MissingVariable { .. }) if !entry.enabled => {
                    tracing::debug!(server = %name, "skipping unresolved disabled server");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(specs)
    }
}
