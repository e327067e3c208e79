//! Item extraction: LLM answer → validated [`ExtractedItem`] rows.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::llm::{ExtractionResponse, LlmClient, LlmError, RawItem};
use crate::model::{BidDocument, ConfidenceThreshold, ExtractedItem, trade_key};
use crate::store::BidStore;

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn clean(text: Option<String>) -> Option<String> {
    text.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Turn one model answer into items for `document_id`.
///
/// `confidence_scores`, when present, overrides per-item confidence and
/// must have one entry per proposed item. Items without a description are
/// dropped before line numbers are assigned.
pub fn build_items(
    document_id: Uuid,
    response: ExtractionResponse,
    threshold: &ConfidenceThreshold,
) -> Result<Vec<ExtractedItem>, LlmError> {
    let ExtractionResponse {
        items,
        confidence_scores,
    } = response;

    if let Some(scores) = &confidence_scores {
        if scores.len() != items.len() {
            return Err(LlmError::parse(format!(
                "confidence_scores has {} entries for {} items",
                scores.len(),
                items.len()
            )));
        }
    }

    let mut built = Vec::with_capacity(items.len());
    for (index, raw) in items.into_iter().enumerate() {
        let RawItem {
            description,
            category,
            quantity,
            unit,
            unit_price,
            total_price,
            is_exclusion,
            is_inclusion,
            confidence,
        } = raw;

        let description = description.trim();
        if description.is_empty() {
            debug!(%document_id, index, "dropping item without description");
            continue;
        }

        let score = confidence_scores
            .as_ref()
            .map(|scores| scores[index])
            .or(confidence)
            .map(clamp_confidence)
            .unwrap_or(0.0);

        let quantity = finite(quantity);
        let unit_price = finite(unit_price);
        let total_price = finite(total_price).or(match (quantity, unit_price) {
            (Some(qty), Some(price)) => Some(qty * price),
            _ => None,
        });

        let mut item = ExtractedItem::new(document_id, built.len() as i32 + 1, description);
        item.category = clean(category);
        item.unit = clean(unit);
        item.quantity = quantity;
        item.unit_price = unit_price;
        item.total_price = total_price;
        item.is_exclusion = is_exclusion;
        item.is_inclusion = is_inclusion;
        item.confidence = score;
        item.confidence_tier = threshold.tier_for(score);
        built.push(item);
    }
    Ok(built)
}

/// Thresholds for a trade, falling back to the defaults when none are stored.
pub async fn thresholds_for(
    store: &dyn BidStore,
    trade_type: &str,
) -> Result<ConfidenceThreshold, PipelineError> {
    Ok(store
        .threshold(&trade_key(trade_type))
        .await?
        .unwrap_or_else(|| ConfidenceThreshold::defaults(trade_type)))
}

/// Extract the items of one document and replace whatever it held before.
#[instrument(skip_all, fields(document_id = %document.id, contractor = %document.contractor_name))]
pub async fn extract_document_items(
    store: &dyn BidStore,
    llm: &dyn LlmClient,
    document: &BidDocument,
    trade_type: &str,
    threshold: &ConfidenceThreshold,
) -> Result<Vec<ExtractedItem>, PipelineError> {
    let raw_text = document.raw_text.as_deref().unwrap_or_default();
    let response = llm.extract_items(trade_type, raw_text).await?;
    let proposed = response.items.len();
    let items = build_items(document.id, response, threshold)?;
    if items.len() < proposed {
        warn!(
            proposed,
            kept = items.len(),
            "model proposed items without description"
        );
    }

    store.replace_items(document.id, &items).await?;
    metrics::counter!("bidvet_items_extracted_total", "trade_type" => trade_type.to_string())
        .increment(items.len() as u64);
    info!(items = items.len(), "items extracted");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, ScriptedLlm};
    use crate::model::{ConfidenceTier, Project};
    use crate::store::MemoryStore;

    fn raw(description: &str, confidence: Option<f64>) -> RawItem {
        RawItem {
            description: description.into(),
            confidence,
            ..RawItem::default()
        }
    }

    #[test]
    fn confidence_is_clamped_and_tiered() {
        let threshold = ConfidenceThreshold::defaults("flooring");
        let response = ExtractionResponse {
            items: vec![
                raw("Demo existing flooring", Some(1.4)),
                raw("Install LVT", Some(0.6)),
                raw("Haul off", Some(f64::NAN)),
                raw("Base", None),
            ],
            confidence_scores: None,
        };
        let items = build_items(Uuid::new_v4(), response, &threshold).unwrap();
        let confidences: Vec<f64> = items.iter().map(|item| item.confidence).collect();
        assert_eq!(confidences, vec![1.0, 0.6, 0.0, 0.0]);
        assert_eq!(items[0].confidence_tier, ConfidenceTier::High);
        assert_eq!(items[1].confidence_tier, ConfidenceTier::Medium);
        assert_eq!(items[2].confidence_tier, ConfidenceTier::Low);
    }

    #[test]
    fn parallel_scores_override_and_must_line_up() {
        let threshold = ConfidenceThreshold::defaults("flooring");
        let response = ExtractionResponse {
            items: vec![raw("Demo", Some(0.1)), raw("Install", Some(0.1))],
            confidence_scores: Some(vec![0.9, 0.45]),
        };
        let items = build_items(Uuid::new_v4(), response.clone(), &threshold).unwrap();
        assert_eq!(items[0].confidence, 0.9);
        assert_eq!(items[1].confidence, 0.45);

        let mismatched = ExtractionResponse {
            confidence_scores: Some(vec![0.9]),
            ..response
        };
        let err = build_items(Uuid::new_v4(), mismatched, &threshold).unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ParseError);
    }

    #[test]
    fn blank_items_are_dropped_and_totals_derived_only_when_missing() {
        let threshold = ConfidenceThreshold::defaults("flooring");
        let response = ExtractionResponse {
            items: vec![
                RawItem {
                    description: "Demo existing flooring".into(),
                    quantity: Some(500.0),
                    unit: Some(" SF ".into()),
                    unit_price: Some(2.0),
                    ..RawItem::default()
                },
                raw("   ", Some(0.9)),
                RawItem {
                    description: "Install LVT".into(),
                    quantity: Some(500.0),
                    unit_price: Some(4.0),
                    total_price: Some(1900.0),
                    category: Some("".into()),
                    ..RawItem::default()
                },
            ],
            confidence_scores: None,
        };
        let items = build_items(Uuid::new_v4(), response, &threshold).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].line_number, 1);
        assert_eq!(items[0].total_price, Some(1000.0));
        assert_eq!(items[0].unit.as_deref(), Some("SF"));
        assert_eq!(items[1].line_number, 2);
        assert_eq!(items[1].total_price, Some(1900.0));
        assert_eq!(items[1].category, None);
    }

    #[tokio::test]
    async fn extraction_replaces_prior_items_of_the_document() {
        let store = MemoryStore::new();
        let project = Project::new(Uuid::new_v4(), "Lobby", "flooring");
        let mut document = BidDocument::new(project.id, "Acme", "a.pdf", "pdf");
        document.raw_text = Some("ACME bid".into());
        store.insert_project(project.clone()).await;
        store.insert_document(document.clone()).await;
        store
            .insert_items(vec![ExtractedItem::new(document.id, 1, "stale")])
            .await;

        let llm = ScriptedLlm::new().on_text(
            "ACME",
            Ok(ExtractionResponse {
                items: vec![raw("Demo existing flooring", Some(0.9))],
                confidence_scores: None,
            }),
        );
        let threshold = thresholds_for(&store, "flooring").await.unwrap();
        extract_document_items(&store, &llm, &document, "flooring", &threshold)
            .await
            .unwrap();

        let items = store.project_items(project.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Demo existing flooring");
    }
}
