//! Per-item stage outcomes and the failure taxonomy.
//!
//! Every unit of work that passes through a stage ends up with exactly one
//! [`StageResult`]. Failures are carried as [`ErrorInfo`] so they can be
//! serialized into events and compared in tests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Anything that can be fanned out by the batch runner.
///
/// The identifier is used for result correlation only; the runner never
/// inspects the payload.
pub trait WorkItem {
    /// Stable identifier, unique within one batch
    fn item_id(&self) -> &str;
}

impl WorkItem for String {
    fn item_id(&self) -> &str {
        self
    }
}

/// Classification of a failure, used to drive control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider unavailable or rejected this request; try the next one
    TransientProvider,

    /// Timeout or rate limit; retry with backoff before moving on
    Retryable,

    /// Bad credentials; abort without trying other providers
    FatalAuth,

    /// Every provider in the fallback chain failed
    ExhaustedChain,

    /// Bad input to a stage; the item is skipped
    Validation,

    /// Cooperative stop
    Cancelled,

    /// Anything else
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientProvider => "transient_provider",
            Self::Retryable => "retryable",
            Self::FatalAuth => "fatal_auth",
            Self::ExhaustedChain => "exhausted_chain",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable failure payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for ErrorInfo {
    fn from(err: anyhow::Error) -> Self {
        Self::unexpected(format!("{:#}", err))
    }
}

/// Outcome of one work item in one stage. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StageResult<T> {
    Success(T),
    Failure(ErrorInfo),
    Skipped(String),
}

impl<T> StageResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Failure(info) => Some(info),
            _ => None,
        }
    }
}
