//! OpenRouter adapter for chat completions.
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint. Each
//! provider instance is bound to one model so a fallback chain is just a
//! list of these sharing one HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, Provider, ProviderError, TokenUsage};
use crate::agents::AgentRole;
use crate::config::ModelSettings;

/// Default retry-after when a 429 carries no usable header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// OpenRouter provider bound to a single model
pub struct OpenRouterProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    site_url: Option<String>,
    site_name: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            site_url: None,
            site_name: None,
        }
    }

    /// Attribution headers OpenRouter shows on its dashboard
    pub fn with_site(mut self, url: Option<String>, name: Option<String>) -> Self {
        self.site_url = url;
        self.site_name = name;
        self
    }

    /// Build the ordered provider list for one agent role
    pub fn chain_for(
        client: &reqwest::Client,
        settings: &ModelSettings,
        role: AgentRole,
    ) -> Vec<Self> {
        let api_key = std::env::var(&settings.api_key_env).ok();
        let site_url = std::env::var("OPENROUTER_SITE_URL").ok();
        let site_name = std::env::var("OPENROUTER_SITE_NAME").ok();

        settings
            .chain_for(role)
            .into_iter()
            .map(|model| {
                Self::new(client.clone(), settings.endpoint.clone(), model, api_key.clone())
                    .with_site(site_url.clone(), site_name.clone())
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub fn classify_status(
    status: u16,
    retry_after: Option<&str>,
    message: String,
    request_timeout: Duration,
) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Authentication(message),
        429 => {
            let retry_after = retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            ProviderError::RateLimited {
                retry_after: Some(retry_after),
            }
        }
        404 => ProviderError::Unavailable(format!("model not found: {}", message)),
        408 => ProviderError::Timeout(request_timeout),
        500..=599 => ProviderError::Unavailable(format!("server error {}: {}", status, message)),
        _ => ProviderError::BadRequest { status, message },
    }
}

fn map_transport_error(err: reqwest::Error, request_timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(request_timeout)
    } else if err.is_connect() {
        ProviderError::Unavailable(err.to_string())
    } else {
        ProviderError::Unexpected(err.to_string())
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Authentication("API key not configured".to_string())
        })?;

        let params = &request.parameters;
        let timeout = params.request_timeout();
        let body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "top_p": params.top_p,
            "frequency_penalty": params.frequency_penalty,
            "presence_penalty": params.presence_penalty,
            "stream": false,
        });

        let mut builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&body);
        if let Some(ref url) = self.site_url {
            builder = builder.header("HTTP-Referer", url);
        }
        if let Some(ref name) = self.site_name {
            builder = builder.header("X-Title", name);
        }

        debug!(model = %self.model, "Sending completion request");
        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| {
                    if text.is_empty() {
                        format!("HTTP error {}", status.as_u16())
                    } else {
                        text
                    }
                });
            return Err(classify_status(
                status.as_u16(),
                retry_after.as_deref(),
                message,
                timeout,
            ));
        }

        let body: ChatCompletionBody = response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("invalid response body: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Unexpected("response has no content".to_string()))?;

        Ok(CompletionResponse {
            content,
            model: body.model.unwrap_or_else(|| self.model.clone()),
            usage: body.usage,
        })
    }
}
