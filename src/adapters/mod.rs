//! Adapter interfaces for external model providers and shared stores.
//!
//! A [`Provider`] is one entry of a fallback chain: a single model behind a
//! single endpoint. Providers report failures as [`ProviderError`], whose
//! [`kind`](ProviderError::kind) decides whether the caller retries, moves
//! to the next provider, or aborts.

pub mod openrouter;
pub mod sqlite;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ErrorInfo, ErrorKind};

pub use openrouter::OpenRouterProvider;
pub use sqlite::SqliteStore;

/// Errors from a single provider call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected ({status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unexpected provider error: {0}")]
    Unexpected(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::BadRequest { .. } => ErrorKind::TransientProvider,
            Self::Timeout(_) | Self::RateLimited { .. } => ErrorKind::Retryable,
            Self::Authentication(_) => ErrorKind::FatalAuth,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Server-supplied wait, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<ProviderError> for ErrorInfo {
    fn from(err: ProviderError) -> Self {
        ErrorInfo::new(err.kind(), err.to_string())
    }
}

/// A chat message for LLM completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Unknown or mistyped parameter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("unknown parameter: {0}")]
    Unknown(String),

    #[error("invalid value for parameter {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Model parameters sent with every completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_top_p() -> f32 {
    1.0
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            request_timeout_seconds: default_request_timeout(),
            stream: false,
        }
    }
}

impl Parameters {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Copy with the overrides applied; `self` is left untouched
    pub fn merged(&self, overrides: &ParameterOverrides) -> Self {
        Self {
            temperature: overrides.temperature.unwrap_or(self.temperature),
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            frequency_penalty: overrides
                .frequency_penalty
                .unwrap_or(self.frequency_penalty),
            presence_penalty: overrides.presence_penalty.unwrap_or(self.presence_penalty),
            request_timeout_seconds: overrides
                .request_timeout_seconds
                .unwrap_or(self.request_timeout_seconds),
            stream: overrides.stream.unwrap_or(self.stream),
        }
    }

    /// Parameters that influence the model output (timeout and stream excluded)
    pub fn cacheable(&self) -> BTreeMap<&'static str, serde_json::Value> {
        BTreeMap::from([
            ("temperature", serde_json::json!(self.temperature)),
            ("max_tokens", serde_json::json!(self.max_tokens)),
            ("top_p", serde_json::json!(self.top_p)),
            ("frequency_penalty", serde_json::json!(self.frequency_penalty)),
            ("presence_penalty", serde_json::json!(self.presence_penalty)),
        ])
    }

    /// Set one parameter by name
    pub fn set(&mut self, name: &str, value: serde_json::Value) -> Result<(), ParameterError> {
        fn invalid(name: &str, expected: &str) -> ParameterError {
            ParameterError::InvalidValue {
                name: name.to_string(),
                message: format!("expected {}", expected),
            }
        }

        match name {
            "temperature" => {
                self.temperature = value.as_f64().ok_or_else(|| invalid(name, "a number"))? as f32
            }
            "max_tokens" => {
                self.max_tokens = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| invalid(name, "a positive integer"))?
            }
            "top_p" => self.top_p = value.as_f64().ok_or_else(|| invalid(name, "a number"))? as f32,
            "frequency_penalty" => {
                self.frequency_penalty =
                    value.as_f64().ok_or_else(|| invalid(name, "a number"))? as f32
            }
            "presence_penalty" => {
                self.presence_penalty =
                    value.as_f64().ok_or_else(|| invalid(name, "a number"))? as f32
            }
            "request_timeout" | "request_timeout_seconds" => {
                self.request_timeout_seconds = value
                    .as_u64()
                    .ok_or_else(|| invalid(name, "whole seconds"))?
            }
            "stream" => self.stream = value.as_bool().ok_or_else(|| invalid(name, "a boolean"))?,
            other => return Err(ParameterError::Unknown(other.to_string())),
        }
        Ok(())
    }
}

/// Per-call parameter overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverrides {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub request_timeout_seconds: Option<u64>,
    pub stream: Option<bool>,
}

/// A fully resolved completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub parameters: Parameters,
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,

    #[serde(default)]
    pub completion_tokens: u64,

    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Response from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,

    /// Model that actually answered
    pub model: String,

    /// Token usage reported upstream
    #[serde(default)]
    pub usage: TokenUsage,
}

/// One model behind one endpoint
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier used in the fallback chain, cache keys and logs
    fn name(&self) -> &str;

    /// Execute a chat completion
    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ProviderError::Unavailable("down".into()).kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            ProviderError::BadRequest {
                status: 400,
                message: "bad".into()
            }
            .kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            ProviderError::Authentication("nope".into()).kind(),
            ErrorKind::FatalAuth
        );
    }

    #[test]
    fn test_merge_does_not_mutate_defaults() {
        let defaults = Parameters::default();
        let merged = defaults.merged(&ParameterOverrides {
            temperature: Some(0.7),
            stream: Some(true),
            ..Default::default()
        });

        assert_eq!(merged.temperature, 0.7);
        assert!(merged.stream);
        assert_eq!(merged.max_tokens, defaults.max_tokens);
        assert_eq!(defaults.temperature, 0.1);
        assert!(!defaults.stream);
    }

    #[test]
    fn test_cacheable_excludes_volatile_fields() {
        let mut a = Parameters::default();
        let mut b = Parameters::default();
        a.request_timeout_seconds = 5;
        b.request_timeout_seconds = 500;
        b.stream = true;

        assert_eq!(a.cacheable(), b.cacheable());
        assert!(!a.cacheable().contains_key("stream"));
    }

    #[test]
    fn test_set_parameter() {
        let mut params = Parameters::default();
        params.set("max_tokens", json!(256)).unwrap();
        params.set("request_timeout", json!(30)).unwrap();
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.request_timeout(), Duration::from_secs(30));

        assert_eq!(
            params.set("seed", json!(1)),
            Err(ParameterError::Unknown("seed".to_string()))
        );
        assert!(matches!(
            params.set("stream", json!("yes")),
            Err(ParameterError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_chat_message_creation() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }
}
