//! Resilient call client: cache, fallback chain, bounded retry and usage.
//!
//! One client wraps one logical operation (for example "claim_detector").
//! A call merges per-call overrides onto the client defaults, looks the
//! request up in the `model_responses` cache under every provider of the
//! chain, and otherwise walks the chain in order:
//!
//! - transient failures (unavailable, bad request) and unexpected errors
//!   move on to the next provider
//! - timeouts and rate limits are retried on the same provider with
//!   exponential backoff, honoring a server-supplied retry-after
//! - authentication failures abort the whole call
//!
//! Retries per provider and the length of the chain are bounded
//! independently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    ChatMessage, CompletionRequest, CompletionResponse, ParameterError, ParameterOverrides,
    Parameters, Provider, ProviderError, TokenUsage,
};
use crate::core::cache::{namespaces, Cache};
use crate::core::rate_limiter::RateLimiter;
use crate::core::retry::RetryPolicy;
use crate::domain::{ErrorInfo, ErrorKind};

/// Errors from [`ResilientCallClient::complete`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("authentication failed at {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("all providers failed for {operation} (tried {attempted:?}): {last_error}")]
    Exhausted {
        operation: String,
        attempted: Vec<String>,
        last_error: ProviderError,
    },

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("call cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::FatalAuth,
            Self::Exhausted { .. } => ErrorKind::ExhaustedChain,
            Self::RateLimited { .. } => ErrorKind::Retryable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ModelError> for ErrorInfo {
    fn from(err: ModelError) -> Self {
        ErrorInfo::new(err.kind(), err.to_string())
    }
}

/// Ordered providers for one operation. Fixed once built.
#[derive(Clone, Default)]
pub struct FallbackChain {
    providers: Vec<Arc<dyn Provider>>,
}

impl FallbackChain {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FallbackChain").field(&self.names()).finish()
    }
}

/// A successful completion and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub response: CompletionResponse,

    /// Provider that produced the response
    pub provider: String,

    /// Served from cache rather than upstream
    pub cached: bool,
}

impl Completion {
    pub fn content(&self) -> &str {
        &self.response.content
    }
}

/// Client wrapping one logical operation
pub struct ResilientCallClient {
    operation: String,
    chain: FallbackChain,
    defaults: RwLock<Parameters>,
    retry: RetryPolicy,
    cache: Option<Arc<Cache>>,
    cache_ttl: Option<Duration>,
    usage: Mutex<TokenUsage>,
    limiter: Option<(Arc<RateLimiter>, String)>,
    cancel: Option<CancellationToken>,
}

impl ResilientCallClient {
    pub fn new(operation: impl Into<String>, chain: FallbackChain) -> Self {
        Self {
            operation: operation.into(),
            chain,
            defaults: RwLock::new(Parameters::default()),
            retry: RetryPolicy::default(),
            cache: None,
            cache_ttl: None,
            usage: Mutex::new(TokenUsage::default()),
            limiter: None,
            cancel: None,
        }
    }

    pub fn with_parameters(self, parameters: Parameters) -> Self {
        *self.defaults.write() = parameters;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cache responses; `ttl` falls back to the cache default
    pub fn with_cache(mut self, cache: Arc<Cache>, ttl: Option<Duration>) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    /// Admit upstream calls through `limiter` under `identifier`
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>, identifier: impl Into<String>) -> Self {
        self.limiter = Some((limiter, identifier.into()));
        self
    }

    /// Stop retrying once `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    /// Snapshot of the default parameters
    pub fn parameters(&self) -> Parameters {
        self.defaults.read().clone()
    }

    /// Set one default parameter by name
    pub fn set_parameter(&self, name: &str, value: serde_json::Value) -> Result<(), ParameterError> {
        self.defaults.write().set(name, value)
    }

    /// Apply several defaults at once; nothing changes if any is rejected
    pub fn update_parameters<I>(&self, updates: I) -> Result<(), ParameterError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut defaults = self.defaults.write();
        let mut next = defaults.clone();
        for (name, value) in updates {
            next.set(&name, value)?;
        }
        *defaults = next;
        Ok(())
    }

    /// Upstream token usage since creation or the last reset
    pub fn usage(&self) -> TokenUsage {
        *self.usage.lock()
    }

    pub fn reset_usage(&self) {
        *self.usage.lock() = TokenUsage::default();
    }

    fn check_cancelled(&self) -> Result<(), ModelError> {
        match self.cancel {
            Some(ref token) if token.is_cancelled() => Err(ModelError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn backoff(&self, delay: Duration) -> Result<(), ModelError> {
        match self.cancel {
            Some(ref token) => tokio::select! {
                _ = token.cancelled() => Err(ModelError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// Complete `messages`, trying the cache and then each provider in order
    #[instrument(skip(self, messages, overrides), fields(operation = %self.operation))]
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        overrides: &ParameterOverrides,
    ) -> Result<Completion, ModelError> {
        let parameters = self.defaults.read().merged(overrides);

        let cache = self
            .cache
            .as_ref()
            .filter(|c| c.is_enabled() && !parameters.stream);
        let cache_key = cache.map(|_| json!({"messages": &messages, "parameters": parameters.cacheable()}));

        if let (Some(cache), Some(key)) = (cache, cache_key.as_ref()) {
            for provider in self.chain.providers() {
                let entry_key = (key, provider.name());
                if let Some(response) = cache
                    .get::<_, CompletionResponse>(namespaces::MODEL_RESPONSES, &entry_key)
                    .await
                {
                    debug!(provider = provider.name(), "Serving completion from cache");
                    return Ok(Completion {
                        response,
                        provider: provider.name().to_string(),
                        cached: true,
                    });
                }
            }
        }

        if let Some((ref limiter, ref identifier)) = self.limiter {
            let admission = limiter.check(identifier, None).await;
            if !admission.allowed {
                warn!(identifier = %identifier, retry_after = ?admission.retry_after, "Upstream call rejected by rate limiter");
                return Err(ModelError::RateLimited {
                    retry_after: admission.retry_after,
                });
            }
        }

        let request = CompletionRequest {
            messages,
            parameters,
        };
        let timeout = request.parameters.request_timeout();

        let mut attempted = Vec::with_capacity(self.chain.len());
        let mut last_error = ProviderError::Unavailable("no providers configured".to_string());

        for provider in self.chain.providers() {
            let name = provider.name().to_string();
            attempted.push(name.clone());
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                self.check_cancelled()?;

                let outcome = match tokio::time::timeout(timeout, provider.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                };

                let err = match outcome {
                    Ok(response) => {
                        self.usage.lock().add(&response.usage);
                        if let (Some(cache), Some(key)) = (cache, cache_key.as_ref()) {
                            cache
                                .set(
                                    namespaces::MODEL_RESPONSES,
                                    &(key, name.as_str()),
                                    &response,
                                    self.cache_ttl,
                                )
                                .await;
                        }
                        if attempted.len() > 1 {
                            info!(provider = %name, "Completed with fallback provider");
                        }
                        return Ok(Completion {
                            response,
                            provider: name,
                            cached: false,
                        });
                    }
                    Err(err) => err,
                };

                match err.kind() {
                    ErrorKind::FatalAuth => {
                        error!(provider = %name, error = %err, "Authentication failed, aborting call");
                        return Err(ModelError::Authentication {
                            provider: name,
                            message: err.to_string(),
                        });
                    }
                    ErrorKind::Retryable if self.retry.should_retry(attempt) => {
                        let delay = err
                            .retry_after()
                            .unwrap_or_else(|| self.retry.delay_for_attempt(attempt));
                        warn!(
                            provider = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying provider call"
                        );
                        last_error = err;
                        self.backoff(delay).await?;
                    }
                    _ => {
                        warn!(provider = %name, attempt, error = %err, "Provider failed, trying next in chain");
                        last_error = err;
                        break;
                    }
                }
            }
        }

        error!(attempted = ?attempted, error = %last_error, "Fallback chain exhausted");
        Err(ModelError::Exhausted {
            operation: self.operation.clone(),
            attempted,
            last_error,
        })
    }
}
