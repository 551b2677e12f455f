//! The language-model oracle capability.
//!
//! The core never talks to a provider directly; it consumes this trait.
//! `HttpOracle` is the production implementation: an OpenAI-compatible
//! chat-completions client with an explicit deadline. Credit exhaustion is
//! the one provider failure surfaced to the user, so it gets its own kind.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OracleError;

/// Task the oracle is being asked to perform. Used for provider-side
/// routing and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleCapability {
    Generation,
    Review,
    Debugging,
    Testing,
    Refactoring,
    Documentation,
    Architecture,
}

impl OracleCapability {
    /// Infer the capability from a system prompt. First keyword wins;
    /// generation is the fallback.
    pub fn detect(system_prompt: &str) -> Self {
        let lower = system_prompt.to_lowercase();
        if lower.contains("review") {
            Self::Review
        } else if lower.contains("debug") || lower.contains("diagnos") {
            Self::Debugging
        } else if lower.contains("test") {
            Self::Testing
        } else if lower.contains("refactor") {
            Self::Refactoring
        } else if lower.contains("document") {
            Self::Documentation
        } else if lower.contains("architect") {
            Self::Architecture
        } else {
            Self::Generation
        }
    }
}

/// Per-call options. Unset fields take defaults; out-of-range values are
/// clamped, never rejected.
#[derive(Debug, Clone, Default)]
pub struct OracleOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub capability: Option<OracleCapability>,
}

const DEFAULT_MAX_TOKENS: u32 = 4000;
const MAX_MAX_TOKENS: u32 = 8000;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const MAX_TEMPERATURE: f32 = 1.5;

impl OracleOptions {
    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).min(MAX_MAX_TOKENS)
    }

    pub fn effective_temperature(&self) -> f32 {
        self.temperature
            .unwrap_or(DEFAULT_TEMPERATURE)
            .clamp(0.0, MAX_TEMPERATURE)
    }

    pub fn effective_capability(&self) -> OracleCapability {
        self.capability.unwrap_or_else(|| {
            self.system_prompt
                .as_deref()
                .map(OracleCapability::detect)
                .unwrap_or(OracleCapability::Generation)
        })
    }
}

/// Opaque language-model provider.
#[async_trait]
pub trait AiOracle: Send + Sync {
    /// Free-form generation from a prompt.
    async fn generate(&self, prompt: &str, options: &OracleOptions)
        -> Result<String, OracleError>;

    /// Analysis of existing content under an instruction.
    async fn analyze(
        &self,
        content: &str,
        instruction: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl HttpOracle {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    async fn chat(
        &self,
        system_prompt: Option<&str>,
        user_prompt: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_prompt,
        });

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": options.effective_max_tokens(),
            "temperature": options.effective_temperature(),
        });

        debug!(
            model = %self.model,
            capability = ?options.effective_capability(),
            max_tokens = options.effective_max_tokens(),
            "oracle request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    OracleError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(OracleError::InsufficientCredits);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if detail.to_lowercase().contains("insufficient credits") {
                return Err(OracleError::InsufficientCredits);
            }
            warn!(status = %status, "oracle returned non-success status");
            return Err(OracleError::Request(format!("{status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Response(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| OracleError::Response("empty choices array".into()))
    }
}

#[async_trait]
impl AiOracle for HttpOracle {
    async fn generate(
        &self,
        prompt: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError> {
        self.chat(options.system_prompt.as_deref(), prompt, options)
            .await
    }

    async fn analyze(
        &self,
        content: &str,
        instruction: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError> {
        let user_prompt = format!("{instruction}\n\n---\n\n{content}");
        self.chat(options.system_prompt.as_deref(), &user_prompt, options)
            .await
    }
}

/// Bounded retry with exponential backoff around another oracle.
///
/// Transient request failures and timeouts are retried (2s, 4s, 8s, …);
/// credit exhaustion and unparseable responses are returned immediately.
pub struct RetryingOracle<O> {
    inner: O,
    max_retries: u32,
    base_delay: Duration,
}

impl<O: AiOracle> RetryingOracle<O> {
    pub fn new(inner: O, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base_delay: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn is_retriable(error: &OracleError) -> bool {
        matches!(error, OracleError::Request(_) | OracleError::Timeout { .. })
    }

    /// Whether to retry after `error` on 0-based `attempt`, sleeping the
    /// backoff delay if so.
    async fn should_retry(&self, attempt: u32, error: &OracleError) -> bool {
        if !Self::is_retriable(error) || attempt >= self.max_retries {
            return false;
        }
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        warn!(
            attempt = attempt + 1,
            max = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "oracle call failed; backing off"
        );
        tokio::time::sleep(delay).await;
        true
    }
}

#[async_trait]
impl<O: AiOracle> AiOracle for RetryingOracle<O> {
    async fn generate(
        &self,
        prompt: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.generate(prompt, options).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    if !self.should_retry(attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn analyze(
        &self,
        content: &str,
        instruction: &str,
        options: &OracleOptions,
    ) -> Result<String, OracleError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.analyze(content, instruction, options).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    if !self.should_retry(attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
