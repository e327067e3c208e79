//! LLM seam used by item extraction, LLM-mode normalization and the
//! recommendation step.
//!
//! Every failure is reduced to an [`LlmErrorKind`] before it leaves this
//! module; callers never see transport errors directly.

pub mod config;
pub mod http;
pub mod scripted;

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, IntoStaticStr};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::model::ComparisonSummary;

pub use config::{LlmProvider, LlmRuntimeConfig, RetryPolicy};
pub use http::HttpLlmClient;
pub use scripted::ScriptedLlm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    RateLimit,
    Timeout,
    ParseError,
    AuthError,
    NetworkError,
    QuotaError,
    UnknownError,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    /// Transient kinds that a later attempt may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimit | LlmErrorKind::Timeout | LlmErrorKind::NetworkError
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ParseError, message)
    }
}

/// Classify a non-success HTTP status from an LLM provider.
pub fn classify_status(status: u16, body: &str) -> LlmErrorKind {
    let body = body.to_ascii_lowercase();
    let mentions_quota = ["quota", "billing", "credit balance", "insufficient_quota"]
        .iter()
        .any(|needle| body.contains(needle));
    match status {
        402 => LlmErrorKind::QuotaError,
        429 if mentions_quota => LlmErrorKind::QuotaError,
        429 => LlmErrorKind::RateLimit,
        401 | 403 => LlmErrorKind::AuthError,
        408 | 504 => LlmErrorKind::Timeout,
        // Provider overload is reported as 503 or 529.
        503 | 529 => LlmErrorKind::RateLimit,
        500..=599 => LlmErrorKind::NetworkError,
        _ => LlmErrorKind::UnknownError,
    }
}

/// Classify a free-form error message when no status code is available.
pub fn classify_message(message: &str) -> LlmErrorKind {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
    if has(&["quota", "billing", "insufficient credit"]) {
        LlmErrorKind::QuotaError
    } else if has(&["rate limit", "rate_limit", "too many requests", "429", "overloaded"]) {
        LlmErrorKind::RateLimit
    } else if has(&["timed out", "timeout", "deadline"]) {
        LlmErrorKind::Timeout
    } else if has(&["unauthorized", "forbidden", "api key", "authentication"]) {
        LlmErrorKind::AuthError
    } else if has(&["json", "parse", "unexpected token", "invalid response"]) {
        LlmErrorKind::ParseError
    } else if has(&["connection", "network", "dns", "reset by peer", "unreachable"]) {
        LlmErrorKind::NetworkError
    } else {
        LlmErrorKind::UnknownError
    }
}

fn record_failure(operation: &'static str, kind: LlmErrorKind) {
    metrics::counter!(
        "bidvet_llm_errors_total",
        "operation" => operation,
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Run `call`, retrying transient failures with linear backoff
/// (`backoff × attempt`). Every failed attempt is counted by kind.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let started = Instant::now();
        let result = call().await;
        metrics::histogram!("bidvet_llm_request_duration_seconds", "operation" => operation)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                record_failure(operation, err.kind);
                if !err.kind.is_retryable() || attempt >= policy.max_retries {
                    return Err(err);
                }
                attempt += 1;
                let delay = policy.backoff.saturating_mul(attempt);
                warn!(
                    operation,
                    attempt,
                    kind = err.kind.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "llm call failed; retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Accepts JSON numbers and strings such as `"$1,250.00"` or `"500 SF"`.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Other(serde_json::Value),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(value)) if value.is_finite() => Some(value),
        Some(Raw::Text(text)) => parse_amount(&text),
        _ => None,
    })
}

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d[\d,]*(?:\.\d+)?|\.\d+)").unwrap());

/// First number in `text`, thousands separators dropped. Accounting
/// parentheses and a leading minus make it negative.
pub(crate) fn parse_amount(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')') || trimmed.starts_with('-');
    let found = AMOUNT_RE.find(trimmed)?;
    let value: f64 = found.as_str().replace(',', "").parse().ok()?;
    value
        .is_finite()
        .then_some(if negative { -value } else { value })
}

/// One line item as proposed by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub unit_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub is_exclusion: bool,
    #[serde(default)]
    pub is_inclusion: bool,
    #[serde(default, deserialize_with = "lenient_number")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub items: Vec<RawItem>,
    /// Parallel to `items` when present.
    #[serde(default)]
    pub confidence_scores: Option<Vec<f64>>,
}

/// Item view sent to the model for bucket proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeItemInput {
    pub item_id: Uuid,
    pub document_id: Uuid,
    pub contractor_name: String,
    pub description: String,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub total_price: Option<f64>,
    pub is_exclusion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedBucket {
    pub label: String,
    #[serde(default)]
    pub item_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationDraft {
    pub contractor_name: String,
    pub confidence_tier: String,
    #[serde(default)]
    pub reasoning: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn extract_items(
        &self,
        trade_type: &str,
        raw_text: &str,
    ) -> Result<ExtractionResponse, LlmError>;

    async fn normalize(
        &self,
        trade_type: &str,
        items: &[ScopeItemInput],
    ) -> Result<Vec<ProposedBucket>, LlmError>;

    async fn recommend(&self, summary: &ComparisonSummary)
    -> Result<RecommendationDraft, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(classify_status(429, ""), LlmErrorKind::RateLimit);
        assert_eq!(
            classify_status(429, r#"{"error":{"code":"insufficient_quota"}}"#),
            LlmErrorKind::QuotaError
        );
        assert_eq!(classify_status(401, ""), LlmErrorKind::AuthError);
        assert_eq!(classify_status(504, ""), LlmErrorKind::Timeout);
        assert_eq!(classify_status(529, "overloaded"), LlmErrorKind::RateLimit);
        assert_eq!(classify_status(502, ""), LlmErrorKind::NetworkError);
        assert_eq!(classify_status(400, "bad"), LlmErrorKind::UnknownError);
    }

    #[test]
    fn messages_map_to_kinds() {
        assert_eq!(classify_message("Rate limit reached"), LlmErrorKind::RateLimit);
        assert_eq!(classify_message("operation timed out"), LlmErrorKind::Timeout);
        assert_eq!(classify_message("expected value at line 1"), LlmErrorKind::UnknownError);
        assert_eq!(classify_message("invalid JSON body"), LlmErrorKind::ParseError);
        assert_eq!(classify_message("connection refused"), LlmErrorKind::NetworkError);
        assert_eq!(LlmErrorKind::QuotaError.as_str(), "quota_error");
    }

    #[test]
    fn lenient_numbers_accept_currency_strings() {
        let item: RawItem = serde_json::from_str(
            r#"{"description":"Demo","quantity":"500 SF","unit_price":"$2.00","total_price":"$1,000.00","confidence":null}"#,
        )
        .unwrap();
        assert_eq!(item.quantity, Some(500.0));
        assert_eq!(item.unit_price, Some(2.0));
        assert_eq!(item.total_price, Some(1000.0));
        assert_eq!(item.confidence, None);
        assert_eq!(parse_amount("($250)"), Some(-250.0));
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("approx. 1,250.5 LF"), Some(1250.5));
    }

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::ZERO,
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retries(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::new(LlmErrorKind::RateLimit, "slow down")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, LlmErrorKind::RateLimit);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retries(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::parse("not json")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, LlmErrorKind::ParseError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let value = with_retries(&policy, "test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(LlmError::new(LlmErrorKind::Timeout, "timeout"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
