//! Token, Attempt, and Request records.
//!
//! These model the data shapes of the comparison pipeline: the immutable
//! per-token value object, the per-model streaming attempt, and the caller's
//! request. `(request_id, attempt_seq, token_index)` is the primary key in
//! persistent storage and inserts are idempotent under it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One token emitted by one attempt. Never mutated after construction.
///
/// `index` is strictly monotonic within `(request_id, attempt_seq)`, starting
/// at 0 with no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub request_id: String,
    pub attempt_seq: u32,
    pub index: u32,
    pub model_id: String,
    /// Raw token text. May be empty for model-specific delimiters.
    pub text: String,
    /// Wall-clock build time, UTC, millisecond precision.
    pub ts: DateTime<Utc>,
}

/// A {provider, model} pair from the caller's ordered model list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub provider: String,
    pub model: String,
}

/// Status of a streaming attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
    Fallback,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptStatus::Pending => write!(f, "pending"),
            AttemptStatus::Streaming => write!(f, "streaming"),
            AttemptStatus::Completed => write!(f, "completed"),
            AttemptStatus::Failed => write!(f, "failed"),
            AttemptStatus::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "streaming" => Ok(AttemptStatus::Streaming),
            "completed" => Ok(AttemptStatus::Completed),
            "failed" => Ok(AttemptStatus::Failed),
            "fallback" => Ok(AttemptStatus::Fallback),
            other => Err(format!("invalid attempt status: '{other}'")),
        }
    }
}

/// One streaming session against a single model for one request.
///
/// Every Token whose `(request_id, attempt_seq)` exists must have a matching
/// Attempt row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub request_id: String,
    pub attempt_seq: u32,
    pub model_id: String,
    pub provider: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
}

/// Status of a comparison request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Streaming => write!(f, "streaming"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "streaming" => Ok(RequestStatus::Streaming),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(format!("invalid request status: '{other}'")),
        }
    }
}

/// A caller's comparison request, created by intake before the first attempt.
///
/// The core never mutates it except for terminal status transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub prompt: String,
    pub models: Vec<ModelChoice>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}
