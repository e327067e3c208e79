use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{
    ExtractionResponse, LlmClient, LlmError, LlmErrorKind, LlmProvider, LlmRuntimeConfig,
    ProposedBucket, RecommendationDraft, ScopeItemInput, classify_message, classify_status,
    with_retries,
};
use crate::model::ComparisonSummary;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 8192;

const SYSTEM_PROMPT: &str = "You read construction subcontractor bids for a general contractor. \
Answer with a single JSON object and nothing else.";

fn extraction_prompt(trade_type: &str, raw_text: &str) -> String {
    format!(
        "Trade: {trade_type}\n\
         List every priced or scoped line item in the bid below.\n\
         Return {{\"items\": [{{\"description\": string, \"category\": string|null, \
         \"quantity\": number|null, \"unit\": string|null, \"unit_price\": number|null, \
         \"total_price\": number|null, \"is_exclusion\": bool, \"is_inclusion\": bool}}], \
         \"confidence_scores\": [number between 0 and 1, one per item]}}.\n\
         Mark items the bidder explicitly excludes with is_exclusion=true and explicit \
         inclusions with is_inclusion=true. Do not invent prices.\n\n\
         BID TEXT:\n{raw_text}"
    )
}

fn normalize_prompt(trade_type: &str, items: &[ScopeItemInput]) -> Result<String, LlmError> {
    let items = serde_json::to_string(items).map_err(|err| LlmError::parse(err.to_string()))?;
    Ok(format!(
        "Trade: {trade_type}\n\
         Group the line items below into scope buckets so each bucket is the same work \
         across contractors. A bucket holds at most one item per document_id.\n\
         Return {{\"buckets\": [{{\"label\": string, \"item_ids\": [item_id]}}]}}.\n\n\
         ITEMS:\n{items}"
    ))
}

fn recommend_prompt(summary: &ComparisonSummary) -> Result<String, LlmError> {
    let summary =
        serde_json::to_string(summary).map_err(|err| LlmError::parse(err.to_string()))?;
    Ok(format!(
        "Recommend one contractor from this leveled bid comparison. Weigh total_bid \
         (base bid plus scope gap adjustments), exclusions and extraction confidence.\n\
         Return {{\"contractor_name\": string, \"confidence_tier\": \"low\"|\"medium\"|\"high\", \
         \"reasoning\": string}}.\n\nCOMPARISON:\n{summary}"
    ))
}

/// Strip markdown fences some models wrap around JSON answers.
fn json_body(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub(crate) fn parse_answer<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    serde_json::from_str(json_body(text))
        .map_err(|err| LlmError::parse(format!("model answer is not the expected JSON: {err}")))
}

fn transport_error(err: reqwest::Error) -> LlmError {
    let kind = if err.is_timeout() {
        LlmErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        LlmErrorKind::NetworkError
    } else if err.is_decode() {
        LlmErrorKind::ParseError
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), "")
    } else {
        classify_message(&err.to_string())
    };
    LlmError::new(kind, err.to_string())
}

#[derive(Deserialize)]
struct BucketsEnvelope {
    #[serde(default)]
    buckets: Vec<ProposedBucket>,
}

/// reqwest-backed client for OpenAI-compatible chat completions or the
/// Anthropic messages API.
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmRuntimeConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmRuntimeConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| LlmError::new(LlmErrorKind::UnknownError, err.to_string()))?;
        Ok(Self { client, config })
    }

    fn request_body(&self, prompt: &str) -> Value {
        match self.config.provider {
            LlmProvider::OpenAiCompatible => json!({
                "model": self.config.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt},
                ],
            }),
            LlmProvider::Anthropic => json!({
                "model": self.config.model,
                "max_tokens": MAX_OUTPUT_TOKENS,
                "temperature": 0,
                "system": SYSTEM_PROMPT,
                "messages": [{"role": "user", "content": prompt}],
            }),
        }
    }

    fn answer_text(&self, body: &Value) -> Result<String, LlmError> {
        let text = match self.config.provider {
            LlmProvider::OpenAiCompatible => body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            LlmProvider::Anthropic => body.pointer("/content/0/text").and_then(Value::as_str),
        };
        text.map(str::to_string)
            .ok_or_else(|| LlmError::parse("provider response has no answer text"))
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, LlmError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .json(&self.request_body(prompt));
        request = match self.config.provider {
            LlmProvider::OpenAiCompatible => request.bearer_auth(&self.config.api_key),
            LlmProvider::Anthropic => request
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status.as_u16(), &body);
            let snippet: String = body.chars().take(300).collect();
            return Err(LlmError::new(
                kind,
                format!("provider returned {}: {snippet}", status.as_u16()),
            ));
        }

        let body: Value = response.json().await.map_err(transport_error)?;
        self.answer_text(&body)
    }

    async fn complete<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        prompt: &str,
    ) -> Result<T, LlmError> {
        if !self.config.enabled {
            return Err(LlmError::new(
                LlmErrorKind::UnknownError,
                "LLM calls are disabled (LLM_ENABLED=false)",
            ));
        }
        let policy = self.config.retry_policy();
        with_retries(&policy, operation, || async move {
            let text = self.complete_once(prompt).await?;
            debug!(operation, answer_chars = text.len(), "llm answered");
            parse_answer::<T>(&text)
        })
        .await
    }

    fn clip<'a>(&self, text: &'a str) -> &'a str {
        match text.char_indices().nth(self.config.max_input_chars) {
            Some((cut, _)) => &text[..cut],
            None => text,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    #[instrument(skip(self, raw_text), fields(provider = %self.config.provider_name, chars = raw_text.len()))]
    async fn extract_items(
        &self,
        trade_type: &str,
        raw_text: &str,
    ) -> Result<ExtractionResponse, LlmError> {
        let prompt = extraction_prompt(trade_type, self.clip(raw_text));
        self.complete("extract_items", &prompt).await
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn normalize(
        &self,
        trade_type: &str,
        items: &[ScopeItemInput],
    ) -> Result<Vec<ProposedBucket>, LlmError> {
        let prompt = normalize_prompt(trade_type, items)?;
        let envelope: BucketsEnvelope = self.complete("normalize", &prompt).await?;
        Ok(envelope.buckets)
    }

    #[instrument(skip(self, summary))]
    async fn recommend(
        &self,
        summary: &ComparisonSummary,
    ) -> Result<RecommendationDraft, LlmError> {
        let prompt = recommend_prompt(summary)?;
        self.complete("recommend", &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(provider: LlmProvider) -> HttpLlmClient {
        HttpLlmClient::new(LlmRuntimeConfig {
            provider,
            max_input_chars: 5,
            ..LlmRuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn fenced_answers_are_unwrapped() {
        let parsed: RecommendationDraft = parse_answer(
            "```json\n{\"contractor_name\":\"Acme\",\"confidence_tier\":\"high\",\"reasoning\":\"lowest\"}\n```",
        )
        .unwrap();
        assert_eq!(parsed.contractor_name, "Acme");

        let err = parse_answer::<RecommendationDraft>("Acme looks best").unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ParseError);
    }

    #[test]
    fn answer_text_follows_provider_shape() {
        let openai = json!({"choices": [{"message": {"content": "{}"}}]});
        assert_eq!(client(LlmProvider::OpenAiCompatible).answer_text(&openai).unwrap(), "{}");

        let anthropic = json!({"content": [{"type": "text", "text": "{\"items\":[]}"}]});
        assert_eq!(
            client(LlmProvider::Anthropic).answer_text(&anthropic).unwrap(),
            "{\"items\":[]}"
        );
        assert_eq!(
            client(LlmProvider::Anthropic)
                .answer_text(&openai)
                .unwrap_err()
                .kind,
            LlmErrorKind::ParseError
        );
    }

    #[test]
    fn long_input_is_clipped_on_char_boundaries() {
        let client = client(LlmProvider::OpenAiCompatible);
        assert_eq!(client.clip("m²m²m²m²"), "m²m²m");
        assert_eq!(client.clip("abc"), "abc");
    }

    #[tokio::test]
    async fn disabled_client_fails_without_network() {
        let client = HttpLlmClient::new(LlmRuntimeConfig {
            enabled: false,
            ..LlmRuntimeConfig::default()
        })
        .unwrap();
        let err = client.extract_items("flooring", "text").await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::UnknownError);
    }
}
