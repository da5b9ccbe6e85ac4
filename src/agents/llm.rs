//! Model-backed collaborators.
//!
//! Each agent formats a short prompt, sends it through its own
//! [`ResilientCallClient`] and parses the JSON the model returns. Prompt
//! wording is deliberately minimal.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentError, AgentRole, ClaimDetector, EvidenceHunter, VerdictWriter};
use crate::adapters::{ChatMessage, OpenRouterProvider, ParameterOverrides, Provider};
use crate::config::ResolvedConfig;
use crate::core::cache::{namespaces, Cache, NamespacedCache};
use crate::core::client::{FallbackChain, ResilientCallClient};
use crate::core::orchestrator::Orchestrator;
use crate::core::rate_limiter::RateLimiter;
use crate::domain::{Claim, Evidence, Stance, Verdict, VerdictLabel};

const DETECTOR_PROMPT: &str = "You identify check-worthy factual claims in text. \
Reply with JSON only: {\"claims\": [{\"text\": string, \"context\": string, \
\"check_worthiness\": number between 0 and 1, \"domain\": string or null}]}.";

const HUNTER_PROMPT: &str = "You gather evidence for or against a factual claim. \
Reply with JSON only: {\"evidence\": [{\"content\": string, \"source\": string, \
\"relevance\": number between 0 and 1, \"stance\": \"supporting\" | \"contradicting\" | \"neutral\"}]}.";

const WRITER_PROMPT: &str = "You judge a factual claim against the evidence given. \
Reply with JSON only: {\"verdict\": \"true\" | \"false\" | \"partially true\" | \"unverifiable\", \
\"confidence\": number between 0 and 1, \"explanation\": string, \"sources\": [string]}.";

/// Pull the JSON document out of a model reply, dropping code fences and chatter
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    let start = unfenced.find(|c| c == '{' || c == '[');
    let end = unfenced.rfind(|c| c == '}' || c == ']');
    match (start, end) {
        (Some(start), Some(end)) if start <= end => &unfenced[start..=end],
        _ => unfenced,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClaimsReply {
    Wrapped { claims: Vec<RawClaim> },
    Bare(Vec<RawClaim>),
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    text: String,
    #[serde(default)]
    context: String,
    #[serde(default = "default_worthiness", alias = "checkworthiness")]
    check_worthiness: f64,
    #[serde(default)]
    domain: Option<String>,
}

fn default_worthiness() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EvidenceReply {
    Wrapped { evidence: Vec<Evidence> },
    Bare(Vec<Evidence>),
}

#[derive(Debug, Deserialize)]
struct VerdictReply {
    verdict: VerdictLabel,
    confidence: f64,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    sources: Vec<String>,
}

/// Claim detector driven by a chat model
pub struct LlmClaimDetector {
    client: Arc<ResilientCallClient>,
    cache: Option<NamespacedCache>,
}

impl LlmClaimDetector {
    pub fn new(client: Arc<ResilientCallClient>) -> Self {
        Self { client, cache: None }
    }

    /// Reuse earlier detections of identical text
    pub fn with_cache(mut self, cache: NamespacedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn parse(content: &str) -> Result<Vec<Claim>, AgentError> {
        let reply: ClaimsReply = serde_json::from_str(extract_json(content))
            .map_err(|e| AgentError::Detection(format!("unparseable model reply: {}", e)))?;
        let raw = match reply {
            ClaimsReply::Wrapped { claims } | ClaimsReply::Bare(claims) => claims,
        };

        Ok(raw
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|c| {
                let claim = Claim::new(c.text.trim(), c.check_worthiness.clamp(0.0, 1.0))
                    .with_context(c.context);
                match c.domain {
                    Some(domain) => claim.with_domain(domain),
                    None => claim,
                }
            })
            .collect())
    }
}

#[async_trait]
impl ClaimDetector for LlmClaimDetector {
    async fn detect_claims(
        &self,
        text: &str,
        min_score: Option<f64>,
        max_count: Option<usize>,
    ) -> Result<Vec<Claim>, AgentError> {
        let cached = match self.cache {
            Some(ref cache) => cache.get::<_, Vec<Claim>>(text).await,
            None => None,
        };

        let mut claims = match cached {
            Some(claims) => {
                debug!(claims = claims.len(), "Using cached claims");
                claims
            }
            None => {
                let messages = vec![ChatMessage::system(DETECTOR_PROMPT), ChatMessage::user(text)];
                let completion = self
                    .client
                    .complete(messages, &ParameterOverrides::default())
                    .await?;
                let claims = Self::parse(completion.content())?;
                if let Some(ref cache) = self.cache {
                    cache.set(text, &claims, None).await;
                }
                claims
            }
        };

        if let Some(min) = min_score {
            claims.retain(|c| c.check_worthiness >= min);
        }
        claims.sort_by(|a, b| b.check_worthiness.total_cmp(&a.check_worthiness));
        if let Some(max) = max_count {
            claims.truncate(max);
        }
        Ok(claims)
    }
}

/// Evidence hunter driven by a chat model
pub struct LlmEvidenceHunter {
    client: Arc<ResilientCallClient>,
    cache: Option<NamespacedCache>,
}

impl LlmEvidenceHunter {
    pub fn new(client: Arc<ResilientCallClient>) -> Self {
        Self { client, cache: None }
    }

    pub fn with_cache(mut self, cache: NamespacedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn parse(content: &str) -> Result<Vec<Evidence>, AgentError> {
        let reply: EvidenceReply = serde_json::from_str(extract_json(content))
            .map_err(|e| AgentError::Gathering(format!("unparseable model reply: {}", e)))?;
        let evidence = match reply {
            EvidenceReply::Wrapped { evidence } | EvidenceReply::Bare(evidence) => evidence,
        };

        Ok(evidence
            .into_iter()
            .filter(|e| match e.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "Discarding malformed evidence");
                    false
                }
            })
            .collect())
    }
}

#[async_trait]
impl EvidenceHunter for LlmEvidenceHunter {
    async fn gather_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, AgentError> {
        if let Some(ref cache) = self.cache {
            if let Some(evidence) = cache.get::<_, Vec<Evidence>>(&claim.text).await {
                return Ok(evidence);
            }
        }

        let prompt = if claim.context.is_empty() {
            format!("Claim: {}", claim.text)
        } else {
            format!("Claim: {}\nContext: {}", claim.text, claim.context)
        };
        let messages = vec![ChatMessage::system(HUNTER_PROMPT), ChatMessage::user(prompt)];
        let completion = self
            .client
            .complete(messages, &ParameterOverrides::default())
            .await?;
        let evidence = Self::parse(completion.content())?;

        if let Some(ref cache) = self.cache {
            if !evidence.is_empty() {
                cache.set(&claim.text, &evidence, None).await;
            }
        }
        Ok(evidence)
    }
}

/// Verdict writer driven by a chat model
pub struct LlmVerdictWriter {
    client: Arc<ResilientCallClient>,
}

impl LlmVerdictWriter {
    pub fn new(client: Arc<ResilientCallClient>) -> Self {
        Self { client }
    }

    fn parse(claim: &Claim, evidence: &[Evidence], content: &str) -> Result<Verdict, AgentError> {
        let reply: VerdictReply = serde_json::from_str(extract_json(content))
            .map_err(|e| AgentError::Writing(format!("unparseable model reply: {}", e)))?;

        let sources = if reply.sources.is_empty() {
            evidence.iter().map(|e| e.source.clone()).collect()
        } else {
            reply.sources
        };
        let verdict = Verdict::new(claim.text.clone(), reply.verdict, reply.confidence)
            .with_explanation(reply.explanation)
            .with_sources(sources);
        verdict.validate()?;
        Ok(verdict)
    }
}

#[async_trait]
impl VerdictWriter for LlmVerdictWriter {
    async fn write_verdict(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AgentError> {
        let evidence_json = serde_json::to_string_pretty(evidence)
            .map_err(|e| AgentError::Writing(e.to_string()))?;
        let prompt = format!("Claim: {}\nEvidence:\n{}", claim.text, evidence_json);
        let messages = vec![ChatMessage::system(WRITER_PROMPT), ChatMessage::user(prompt)];

        let completion = self
            .client
            .complete(messages, &ParameterOverrides::default())
            .await?;
        Self::parse(claim, evidence, completion.content())
    }
}

/// Build an orchestrator wired to OpenRouter from resolved configuration
pub fn create_default_pipeline(config: &ResolvedConfig) -> Result<Orchestrator> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("verifact/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let cache = Cache::shared();
    let limiter = RateLimiter::shared();
    let cancel = CancellationToken::new();

    let client_for = |role: AgentRole| -> Arc<ResilientCallClient> {
        let providers: Vec<Arc<dyn Provider>> =
            OpenRouterProvider::chain_for(&http, &config.models, role)
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn Provider>)
                .collect();
        debug!(%role, chain = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(), "Built fallback chain");

        Arc::new(
            ResilientCallClient::new(role.as_str(), FallbackChain::new(providers))
                .with_parameters(config.models.parameters.clone())
                .with_retry(config.models.retry.clone())
                .with_cache(Arc::clone(&cache), None)
                .with_rate_limiter(Arc::clone(&limiter), format!("verifact:{}", role))
                .with_cancellation(cancel.clone()),
        )
    };

    let detector = LlmClaimDetector::new(client_for(AgentRole::ClaimDetector))
        .with_cache(cache.namespace(namespaces::CLAIMS));
    let hunter = LlmEvidenceHunter::new(client_for(AgentRole::EvidenceHunter))
        .with_cache(cache.namespace(namespaces::EVIDENCE));
    let writer = LlmVerdictWriter::new(client_for(AgentRole::VerdictWriter));

    Ok(Orchestrator::new(
        Arc::new(detector),
        Arc::new(hunter),
        Arc::new(writer),
        config.pipeline.clone(),
    )
    .with_cancellation(cancel))
}
