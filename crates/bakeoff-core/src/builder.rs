//! Token builder: raw strings to indexed [`Token`] records.

use chrono::Utc;

use bakeoff_types::token::Token;

/// Builds tokens for one attempt with a strictly monotonic index from 0.
///
/// `build` assigns each field exactly once and never blocks.
#[derive(Debug)]
pub struct TokenBuilder {
    request_id: String,
    attempt_seq: u32,
    model_id: String,
    next_index: u32,
}

impl TokenBuilder {
    pub fn new(
        request_id: impl Into<String>,
        attempt_seq: u32,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            attempt_seq,
            model_id: model_id.into(),
            next_index: 0,
        }
    }

    /// Stamp a raw token with the next index, the model id, and the current
    /// wall time.
    pub fn build(&mut self, raw: impl Into<String>) -> Token {
        let token = Token {
            request_id: self.request_id.clone(),
            attempt_seq: self.attempt_seq,
            index: self.next_index,
            model_id: self.model_id.clone(),
            text: raw.into(),
            ts: Utc::now(),
        };
        self.next_index += 1;
        token
    }

    /// Number of tokens built so far (also the next index to be assigned).
    pub fn built(&self) -> u32 {
        self.next_index
    }
}
