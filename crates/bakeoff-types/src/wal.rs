//! WAL line format.
//!
//! One JSON object per line, UTF-8, no embedded newlines. Keys are compact
//! (`r`, `a`, `i`, `m`, `t`, `ts`) to keep the file small. Newlines inside
//! token text are replaced with a single space at serialisation time; this is
//! a one-way normalisation and is not reversed on read.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WalError;
use crate::token::Token;

/// One serialised WAL line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Request id.
    pub r: String,
    /// Attempt sequence, >= 1.
    pub a: u32,
    /// Token index, >= 0.
    pub i: u32,
    /// Model id.
    pub m: String,
    /// Token text, newlines already normalised to spaces.
    pub t: String,
    /// ISO-8601 UTC with millisecond precision, e.g. `2025-06-24T14:01:05.123Z`.
    pub ts: String,
}

impl WalRecord {
    /// Build a record from a token, normalising embedded newlines.
    pub fn from_token(token: &Token) -> Self {
        Self {
            r: token.request_id.clone(),
            a: token.attempt_seq,
            i: token.index,
            m: token.model_id.clone(),
            t: normalize_text(&token.text),
            ts: format_ts(&token.ts),
        }
    }

    /// Serialise to one line (no trailing newline).
    pub fn to_line(&self) -> Result<String, WalError> {
        serde_json::to_string(self).map_err(|e| WalError::Io(e.to_string()))
    }

    /// Parse one line back into a record.
    pub fn parse_line(line: &str) -> Result<Self, WalError> {
        serde_json::from_str(line).map_err(|e| WalError::Corrupt(format!("{e}: {line}")))
    }

    /// Convert back into a [`Token`] for replay.
    pub fn into_token(self) -> Result<Token, WalError> {
        let ts = DateTime::parse_from_rfc3339(&self.ts)
            .map_err(|e| WalError::Corrupt(format!("bad timestamp '{}': {e}", self.ts)))?
            .with_timezone(&Utc);
        Ok(Token {
            request_id: self.r,
            attempt_seq: self.a,
            index: self.i,
            model_id: self.m,
            text: self.t,
            ts,
        })
    }
}

/// Format a timestamp the way the WAL stores it: UTC, millisecond precision,
/// `Z` suffix.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn normalize_text(text: &str) -> String {
    if text.contains(['\n', '\r']) {
        text.replace(['\n', '\r'], " ")
    } else {
        text.to_string()
    }
}
