//! OpenAI-compatible chat completions adapter.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::{LanguageModel, LlmError, LlmRequest, RetryConfig, truncate_at_stop};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub model: String,
    pub api_base: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl OpenAiConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }

    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Which optional request parameters the provider still accepts.
#[derive(Debug, Clone, Copy)]
struct ParamSupport {
    stop: bool,
    temperature: bool,
    max_tokens: bool,
}

impl ParamSupport {
    /// Drop the parameter an error message complains about, if any.
    fn fall_back(&mut self, request: &LlmRequest, message: &str) -> Option<&'static str> {
        let message = message.to_lowercase();
        if self.stop && !request.stop.is_empty() && message.contains("stop") {
            self.stop = false;
            Some("stop")
        } else if self.temperature
            && request.temperature.is_some()
            && message.contains("temperature")
        {
            self.temperature = false;
            Some("temperature")
        } else if self.max_tokens && request.max_tokens.is_some() && message.contains("max_tokens")
        {
            self.max_tokens = false;
            Some("max_tokens")
        } else {
            None
        }
    }
}

pub struct OpenAiCompatibleModel {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl std::fmt::Debug for OpenAiCompatibleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleModel")
            .field("model", &self.config.model)
            .field("api_base", &self.config.api_base)
            .finish()
    }
}

impl OpenAiCompatibleModel {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &LlmRequest, params: ParamSupport) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": request.messages,
        });

        if params.stop && !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }
        if params.temperature
            && let Some(temperature) = request.temperature
        {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            let key = if params.max_tokens {
                "max_tokens"
            } else {
                "max_completion_tokens"
            };
            body[key] = json!(max_tokens);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<String, LlmError> {
        let mut req = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.config.timeout)
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let choice = value["choices"]
            .get(0)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))?;
        Ok(choice["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn send_with_retry(&self, body: &Value) -> Result<String, LlmError> {
        let retry = &self.config.retry;
        let mut attempts = 0;
        loop {
            match self.send(body).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    attempts += 1;
                    let Some(delay) = retry.next_delay(attempts, &e) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        model = %self.config.model,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying model request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let mut params = ParamSupport {
            stop: true,
            temperature: true,
            max_tokens: true,
        };

        loop {
            let body = self.build_body(request, params);
            match self.send_with_retry(&body).await {
                Ok(content) if params.stop => return Ok(content),
                Ok(content) => return Ok(truncate_at_stop(&content, &request.stop)),
                Err(LlmError::Api { status, message }) if (400..500).contains(&status) => {
                    match params.fall_back(request, &message) {
                        Some(param) => {
                            tracing::warn!(
                                model = %self.config.model,
                                param,
                                "provider rejected parameter, retrying without it"
                            );
                        }
                        None => return Err(LlmError::Api { status, message }),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
