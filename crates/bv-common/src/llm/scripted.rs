use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ExtractionResponse, LlmClient, LlmError, ProposedBucket, RecommendationDraft, ScopeItemInput,
};
use crate::model::ComparisonSummary;

type Scripted<T> = Result<T, LlmError>;

#[derive(Default)]
struct Script {
    // (marker, answer): the first marker found in the raw text wins.
    extractions: Vec<(String, Scripted<ExtractionResponse>)>,
    normalize: Option<Scripted<Vec<ProposedBucket>>>,
    recommend: Option<Scripted<RecommendationDraft>>,
    extract_calls: usize,
}

/// Deterministic [`LlmClient`] driven by canned answers.
///
/// Extraction answers are keyed by a marker string found in the document
/// text, so results do not depend on call order. Without a scripted
/// recommendation the contractor with the lowest `total_bid` is picked.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<Script>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_text(self, marker: &str, answer: Scripted<ExtractionResponse>) -> Self {
        self.script().extractions.push((marker.to_string(), answer));
        self
    }

    pub fn with_buckets(self, answer: Scripted<Vec<ProposedBucket>>) -> Self {
        self.script().normalize = Some(answer);
        self
    }

    pub fn with_recommendation(self, answer: Scripted<RecommendationDraft>) -> Self {
        self.script().recommend = Some(answer);
        self
    }

    pub fn extract_calls(&self) -> usize {
        self.script().extract_calls
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn extract_items(
        &self,
        _trade_type: &str,
        raw_text: &str,
    ) -> Result<ExtractionResponse, LlmError> {
        let mut script = self.script();
        script.extract_calls += 1;
        script
            .extractions
            .iter()
            .find(|(marker, _)| raw_text.contains(marker.as_str()))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| Ok(ExtractionResponse::default()))
    }

    async fn normalize(
        &self,
        _trade_type: &str,
        items: &[ScopeItemInput],
    ) -> Result<Vec<ProposedBucket>, LlmError> {
        match self.script().normalize.clone() {
            Some(answer) => answer,
            None => Ok(items
                .iter()
                .map(|item| ProposedBucket {
                    label: item.description.clone(),
                    item_ids: vec![item.item_id],
                })
                .collect()),
        }
    }

    async fn recommend(
        &self,
        summary: &ComparisonSummary,
    ) -> Result<RecommendationDraft, LlmError> {
        if let Some(answer) = self.script().recommend.clone() {
            return answer;
        }
        let cheapest = summary
            .contractors
            .iter()
            .min_by(|a, b| a.total_bid.total_cmp(&b.total_bid));
        Ok(RecommendationDraft {
            contractor_name: cheapest
                .map(|rollup| rollup.contractor_name.clone())
                .unwrap_or_default(),
            confidence_tier: "medium".into(),
            reasoning: "lowest leveled total".into(),
        })
    }
}
