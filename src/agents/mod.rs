//! Collaborator interfaces driven by the orchestrator.
//!
//! The orchestrator never looks inside claims, evidence or verdicts; it only
//! calls these three traits and routes their outputs between stages.

pub mod llm;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::client::ModelError;
use crate::domain::{Claim, ErrorInfo, ErrorKind, Evidence, ValidationError, Verdict};

pub use llm::{create_default_pipeline, LlmClaimDetector, LlmEvidenceHunter, LlmVerdictWriter};

/// Which collaborator a model serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ClaimDetector,
    EvidenceHunter,
    VerdictWriter,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaimDetector => "claim_detector",
            Self::EvidenceHunter => "evidence_hunter",
            Self::VerdictWriter => "verdict_writer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborator failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("claim detection failed: {0}")]
    Detection(String),

    #[error("evidence gathering failed: {0}")]
    Gathering(String),

    #[error("verdict writing failed: {0}")]
    Writing(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Detection(_) | Self::Gathering(_) | Self::Writing(_) => ErrorKind::Unexpected,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Model(e) => e.kind(),
        }
    }
}

impl From<AgentError> for ErrorInfo {
    fn from(err: AgentError) -> Self {
        ErrorInfo::new(err.kind(), err.to_string())
    }
}

/// Finds check-worthy claims in text
#[async_trait]
pub trait ClaimDetector: Send + Sync {
    async fn detect_claims(
        &self,
        text: &str,
        min_score: Option<f64>,
        max_count: Option<usize>,
    ) -> Result<Vec<Claim>, AgentError>;
}

/// Gathers evidence for one claim
#[async_trait]
pub trait EvidenceHunter: Send + Sync {
    async fn gather_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, AgentError>;
}

/// Judges one claim against its evidence
#[async_trait]
pub trait VerdictWriter: Send + Sync {
    async fn write_verdict(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(AgentError::Gathering("x".into()).kind(), ErrorKind::Unexpected);
        assert_eq!(
            AgentError::Model(ModelError::Authentication {
                provider: "p".into(),
                message: "bad key".into()
            })
            .kind(),
            ErrorKind::FatalAuth
        );
        let info: ErrorInfo = AgentError::Model(ModelError::Cancelled).into();
        assert_eq!(info.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_role_names() {
        assert_eq!(AgentRole::EvidenceHunter.to_string(), "evidence_hunter");
        let parsed: AgentRole = serde_json::from_str("\"verdict_writer\"").unwrap();
        assert_eq!(parsed, AgentRole::VerdictWriter);
    }
}
