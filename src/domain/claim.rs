//! Claims, evidence and verdicts exchanged with the collaborators.
//!
//! The pipeline core never inspects claim text or evidence content; it only
//! routes these values between stages, validates their shape and keys them
//! by identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::stage::WorkItem;

/// A value failed a shape check before entering a stage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn check_unit_interval(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field,
            format!("{} is outside [0.0, 1.0]", value),
        ))
    }
}

/// A check-worthy factual statement found in the input text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Identifier used to correlate evidence and verdicts
    pub id: String,

    /// Claim text as it should be checked
    pub text: String,

    /// Surrounding text, if the detector captured any
    #[serde(default)]
    pub context: String,

    /// How worth checking the claim is (0.0 - 1.0)
    pub check_worthiness: f64,

    /// Topical domain (politics, science, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// When the claim was extracted
    pub extracted_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(text: impl Into<String>, check_worthiness: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            context: String::new(),
            check_worthiness,
            domain: None,
            extracted_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() {
            return Err(ValidationError::new("claim.text", "cannot be empty"));
        }
        check_unit_interval("claim.check_worthiness", self.check_worthiness)
    }
}

impl WorkItem for Claim {
    fn item_id(&self) -> &str {
        &self.id
    }
}

/// Position a piece of evidence takes towards a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supporting,
    Contradicting,
    Neutral,
}

impl Default for Stance {
    fn default() -> Self {
        Self::Supporting
    }
}

/// One piece of evidence gathered for a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub content: String,
    pub source: String,
    #[serde(default = "default_relevance")]
    pub relevance: f64,
    #[serde(default)]
    pub stance: Stance,
}

fn default_relevance() -> f64 {
    1.0
}

impl Evidence {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            relevance: default_relevance(),
            stance: Stance::default(),
        }
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_stance(mut self, stance: Stance) -> Self {
        self.stance = stance;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::new("evidence.content", "cannot be empty"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::new("evidence.source", "cannot be empty"));
        }
        check_unit_interval("evidence.relevance", self.relevance)
    }
}

/// Verdict label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictLabel {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
    #[serde(rename = "partially true", alias = "partially_true")]
    PartiallyTrue,
    #[serde(rename = "unverifiable")]
    Unverifiable,
}

/// Final judgement on one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Claim text the verdict is about
    pub claim: String,
    pub verdict: VerdictLabel,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Verdict {
    pub fn new(claim: impl Into<String>, verdict: VerdictLabel, confidence: f64) -> Self {
        Self {
            claim: claim.into(),
            verdict,
            confidence,
            explanation: String::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.claim.trim().is_empty() {
            return Err(ValidationError::new("verdict.claim", "cannot be empty"));
        }
        check_unit_interval("verdict.confidence", self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_validation() {
        assert!(Claim::new("The sky is blue.", 0.9).validate().is_ok());

        let empty = Claim::new("   ", 0.9);
        assert_eq!(empty.validate().unwrap_err().field, "claim.text");

        let out_of_range = Claim::new("Water boils at 100C", 1.5);
        assert_eq!(
            out_of_range.validate().unwrap_err().field,
            "claim.check_worthiness"
        );
    }

    #[test]
    fn test_claim_ids_are_unique() {
        let a = Claim::new("same text", 0.5);
        let b = Claim::new("same text", 0.5);
        assert_ne!(a.id, b.id);
        assert_eq!(a.clone().with_id("c-1").item_id(), "c-1");
    }

    #[test]
    fn test_evidence_defaults_on_deserialize() {
        let evidence: Evidence =
            serde_json::from_str(r#"{"content": "Rayleigh scattering", "source": "nasa.gov"}"#)
                .unwrap();
        assert_eq!(evidence.relevance, 1.0);
        assert_eq!(evidence.stance, Stance::Supporting);
        assert!(evidence.validate().is_ok());
    }

    #[test]
    fn test_verdict_label_serialization() {
        let json = serde_json::to_string(&VerdictLabel::PartiallyTrue).unwrap();
        assert_eq!(json, "\"partially true\"");

        let parsed: VerdictLabel = serde_json::from_str("\"true\"").unwrap();
        assert_eq!(parsed, VerdictLabel::True);

        let alias: VerdictLabel = serde_json::from_str("\"partially_true\"").unwrap();
        assert_eq!(alias, VerdictLabel::PartiallyTrue);
    }
}
