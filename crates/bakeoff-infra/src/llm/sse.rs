//! OpenAI-compatible SSE streaming adaptor.
//!
//! Opens a chat-completions request with `stream: true` and maps the `data:`
//! lines to raw token strings. HTTP statuses classify deterministically:
//! 429 -> rate limit, 408/504 -> timeout, remaining 5xx -> provider down,
//! request-shaped 4xx -> fatal. The adaptor is single-shot; retry happens in
//! the safe-call layer by opening a fresh stream.
//!
//! The API key lives in a [`SecretString`] and never appears in Debug output
//! or logs.

use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use bakeoff_core::provider::{ProviderAdaptor, RawTokenStream, RequestCtx};
use bakeoff_types::error::{classify_status, ErrorClass, ProviderError};

/// Outcome of parsing one SSE line.
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    /// A content delta to yield.
    Delta(String),
    /// `data: [DONE]` -- end of stream.
    Done,
    /// Comment, empty line, keepalive, or delta without content.
    Ignored,
    /// Unparseable payload.
    Malformed(String),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => {
            match value["choices"][0]["delta"]["content"].as_str() {
                // The first chunk usually carries only the role; finish
                // chunks carry no delta at all.
                Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
                _ => SseLine::Ignored,
            }
        }
        Err(e) => SseLine::Malformed(format!("malformed sse payload: {e}")),
    }
}

fn error_for_status(provider: &str, status: u16, detail: String) -> ProviderError {
    match classify_status(status) {
        ErrorClass::RateLimit => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after_ms: None,
        },
        ErrorClass::Timeout => ProviderError::Timeout {
            provider: provider.to_string(),
        },
        ErrorClass::ProviderDown => ProviderError::Down {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {detail}"),
        },
        ErrorClass::Fatal => ProviderError::Fatal(format!("HTTP {status}: {detail}")),
    }
}

fn transport_error(provider: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        ProviderError::Down {
            provider: provider.to_string(),
            message: e.to_string(),
        }
    }
}

/// Streaming adaptor for one OpenAI-compatible provider endpoint.
pub struct SseChatAdaptor {
    provider: String,
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl SseChatAdaptor {
    pub fn new(provider: impl Into<String>, base_url: String, api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build reqwest client");
        Self {
            provider: provider.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

impl ProviderAdaptor for SseChatAdaptor {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn stream_raw(&self, model: &str, prompt: &str, ctx: &RequestCtx) -> RawTokenStream {
        let provider = self.provider.clone();
        let client = self.client.clone();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let api_key = self.api_key.clone();
        let model = model.to_string();
        let prompt = prompt.to_string();
        let cancel = ctx.cancel.clone();

        Box::pin(try_stream! {
            let body = serde_json::json!({
                "model": model,
                "stream": true,
                "messages": [{"role": "user", "content": prompt}],
            });

            let send = client
                .post(&url)
                .bearer_auth(api_key.expose_secret())
                .json(&body)
                .send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = send => Some(response),
            };
            let response = match response {
                None => {
                    Err::<(), ProviderError>(ProviderError::Cancelled)?;
                    unreachable!()
                }
                Some(response) => response.map_err(|e| transport_error(&provider, e))?,
            };

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                let detail = response.text().await.unwrap_or_default();
                Err::<(), ProviderError>(error_for_status(&provider, status, detail))?;
                unreachable!();
            }

            let mut chunks = response.bytes_stream();
            let mut pending = String::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = chunks.next() => Some(chunk),
                };
                let chunk = match chunk {
                    None => {
                        Err::<(), ProviderError>(ProviderError::Cancelled)?;
                        unreachable!()
                    }
                    Some(chunk) => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(|e| transport_error(&provider, e))?;
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    match parse_sse_line(line.trim()) {
                        SseLine::Delta(text) => yield text,
                        SseLine::Done => return,
                        SseLine::Ignored => {}
                        SseLine::Malformed(detail) => {
                            Err::<(), ProviderError>(ProviderError::Down {
                                provider: provider.clone(),
                                message: detail,
                            })?;
                        }
                    }
                }
            }
        })
    }
}
