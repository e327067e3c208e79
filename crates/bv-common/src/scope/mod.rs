//! Normalizer / matcher: scope buckets across contractors, gap accounting
//! and per-contractor rollups.

pub mod matcher;
pub mod normalizer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::ScopeItemInput;
use crate::model::{ComparisonSummary, ContractorRef, ContractorRollup, ExtractedItem, ScopeGap};

pub use matcher::{MatchConfig, NormalizationMode, bucket_by_similarity, enforce_proposals, similarity};
pub use normalizer::{description_key, tokens};

/// Items judged to be the same work, at most one per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeBucket {
    pub label: String,
    pub item_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeAnalysis {
    pub bucket_count: usize,
    pub scope_gaps: Vec<ScopeGap>,
    pub rollups: Vec<ContractorRollup>,
    pub price_low: Option<f64>,
    pub price_high: Option<f64>,
    pub price_average: Option<f64>,
}

impl ScopeAnalysis {
    pub fn summary(&self, trade_type: &str) -> ComparisonSummary {
        ComparisonSummary {
            trade_type: trade_type.to_string(),
            contractors: self.rollups.clone(),
            bucket_count: self.bucket_count,
            gap_count: self.scope_gaps.len(),
        }
    }
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Item view handed to the LLM in `llm` normalization mode.
pub fn scope_inputs(contractors: &[ContractorRef], items: &[ExtractedItem]) -> Vec<ScopeItemInput> {
    contractors
        .iter()
        .flat_map(|contractor| {
            items
                .iter()
                .filter(move |item| item.document_id == contractor.document_id)
                .map(move |item| ScopeItemInput {
                    item_id: item.id,
                    document_id: item.document_id,
                    contractor_name: contractor.contractor_name.clone(),
                    description: item.description.clone(),
                    category: item.category.clone(),
                    quantity: item.quantity,
                    unit: item.unit.clone(),
                    total_price: item.effective_price(),
                    is_exclusion: item.is_exclusion,
                })
        })
        .collect()
}

/// Gap list, rollups and price spread for the given buckets.
///
/// A bucket is a gap for every analyzed contractor without an item in it;
/// its estimated value is the average effective price of the items that
/// are present. Each contractor's total bid is its base bid (non-excluded
/// items) plus the estimated value of the gaps it is missing.
pub fn analyze_scope(
    contractors: &[ContractorRef],
    items: &[ExtractedItem],
    buckets: &[ScopeBucket],
) -> ScopeAnalysis {
    let by_id: HashMap<Uuid, &ExtractedItem> = items.iter().map(|item| (item.id, item)).collect();
    let mut gap_adjustment: HashMap<Uuid, f64> = HashMap::new();
    let mut scope_gaps = Vec::new();

    for bucket in buckets {
        let members: Vec<&ExtractedItem> = bucket
            .item_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        if members.is_empty() {
            continue;
        }

        let (present_in, missing_from): (Vec<ContractorRef>, Vec<ContractorRef>) = contractors
            .iter()
            .cloned()
            .partition(|contractor| {
                members
                    .iter()
                    .any(|item| item.document_id == contractor.document_id)
            });
        if missing_from.is_empty() {
            continue;
        }

        let prices: Vec<f64> = members.iter().filter_map(|item| item.effective_price()).collect();
        let estimated_value = average(&prices).map(round_cents);
        for contractor in &missing_from {
            *gap_adjustment.entry(contractor.document_id).or_default() +=
                estimated_value.unwrap_or(0.0);
        }

        scope_gaps.push(ScopeGap {
            label: bucket.label.clone(),
            present_in,
            missing_from,
            estimated_value,
            item_ids: members.iter().map(|item| item.id).collect(),
            excluded_by_present: members.iter().all(|item| item.is_exclusion),
        });
    }

    let rollups: Vec<ContractorRollup> = contractors
        .iter()
        .map(|contractor| {
            let own: Vec<&ExtractedItem> = items
                .iter()
                .filter(|item| item.document_id == contractor.document_id)
                .collect();
            let exclusions: Vec<&&ExtractedItem> = own.iter().filter(|item| item.is_exclusion).collect();
            let base_bid: f64 = own
                .iter()
                .filter(|item| !item.is_exclusion)
                .filter_map(|item| item.effective_price())
                .sum();
            let confidences: Vec<f64> = own.iter().map(|item| item.confidence).collect();
            let adjustment = round_cents(gap_adjustment.get(&contractor.document_id).copied().unwrap_or(0.0));
            let base_bid = round_cents(base_bid);

            ContractorRollup {
                document_id: contractor.document_id,
                contractor_name: contractor.contractor_name.clone(),
                item_count: own.len(),
                exclusion_count: exclusions.len(),
                exclusions_value: round_cents(
                    exclusions.iter().filter_map(|item| item.effective_price()).sum(),
                ),
                average_confidence: average(&confidences),
                base_bid,
                gap_adjustment: adjustment,
                total_bid: round_cents(base_bid + adjustment),
            }
        })
        .collect();

    let bases: Vec<f64> = rollups.iter().map(|rollup| rollup.base_bid).collect();
    ScopeAnalysis {
        bucket_count: buckets.len(),
        scope_gaps,
        price_low: bases.iter().copied().reduce(f64::min),
        price_high: bases.iter().copied().reduce(f64::max),
        price_average: average(&bases).map(round_cents),
        rollups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contractor(name: &str) -> ContractorRef {
        ContractorRef {
            document_id: Uuid::new_v4(),
            contractor_name: name.into(),
        }
    }

    fn priced(contractor: &ContractorRef, line: i32, description: &str, total: f64) -> ExtractedItem {
        let mut item = ExtractedItem::new(contractor.document_id, line, description);
        item.total_price = Some(total);
        item.confidence = 0.9;
        item
    }

    #[test]
    fn exclusion_without_a_match_is_a_gap_for_the_others() {
        let (a, b, c) = (contractor("A"), contractor("B"), contractor("C"));
        let contractors = vec![a.clone(), b.clone(), c.clone()];
        let mut excluded = priced(&a, 2, "Moisture mitigation", 800.0);
        excluded.is_exclusion = true;
        let items = vec![
            priced(&a, 1, "Install carpet tile", 4000.0),
            excluded.clone(),
            priced(&b, 1, "Install carpet tile", 4200.0),
            priced(&c, 1, "Install carpet tile", 3900.0),
        ];

        let buckets = bucket_by_similarity(&contractors, &items, &[], &MatchConfig::default());
        let analysis = analyze_scope(&contractors, &items, &buckets);

        assert_eq!(analysis.bucket_count, 2);
        assert_eq!(analysis.scope_gaps.len(), 1);
        let gap = &analysis.scope_gaps[0];
        assert_eq!(gap.present_in, vec![a.clone()]);
        assert_eq!(gap.missing_from, vec![b.clone(), c.clone()]);
        assert_eq!(gap.estimated_value, Some(800.0));
        assert_eq!(gap.item_ids, vec![excluded.id]);
        assert!(gap.excluded_by_present);

        let rollup_a = &analysis.rollups[0];
        assert_eq!(rollup_a.exclusion_count, 1);
        assert_eq!(rollup_a.exclusions_value, 800.0);
        assert_eq!(rollup_a.base_bid, 4000.0);
        assert_eq!(rollup_a.total_bid, 4000.0);
        assert_eq!(analysis.rollups[1].gap_adjustment, 800.0);
        assert_eq!(analysis.rollups[1].total_bid, 5000.0);
        assert_eq!(analysis.price_low, Some(3900.0));
        assert_eq!(analysis.price_high, Some(4200.0));
        assert_eq!(analysis.price_average, Some(4033.33));
    }

    #[test]
    fn shared_scope_has_no_gap_and_gap_value_averages_present_prices() {
        let (a, b, c) = (contractor("A"), contractor("B"), contractor("C"));
        let contractors = vec![a.clone(), b.clone(), c.clone()];
        let items = vec![
            priced(&a, 1, "Demo existing flooring", 1000.0),
            priced(&b, 1, "Demo existing flooring", 1250.0),
            priced(&c, 1, "Demo existing flooring", 900.0),
            priced(&a, 2, "Floor prep and leveling", 300.0),
            priced(&b, 2, "Floor prep & leveling", 500.0),
        ];
        let buckets = bucket_by_similarity(&contractors, &items, &[], &MatchConfig::default());
        let analysis = analyze_scope(&contractors, &items, &buckets);

        assert_eq!(analysis.bucket_count, 2);
        assert_eq!(analysis.scope_gaps.len(), 1);
        assert_eq!(analysis.scope_gaps[0].missing_from, vec![c.clone()]);
        assert_eq!(analysis.scope_gaps[0].estimated_value, Some(400.0));
        assert!(!analysis.scope_gaps[0].excluded_by_present);
        assert_eq!(analysis.rollups[2].total_bid, 1300.0);
    }

    #[test]
    fn contractors_without_items_still_get_a_rollup() {
        let a = contractor("A");
        let analysis = analyze_scope(&[a.clone()], &[], &[]);
        assert_eq!(analysis.rollups.len(), 1);
        assert_eq!(analysis.rollups[0].item_count, 0);
        assert_eq!(analysis.rollups[0].average_confidence, None);
        assert_eq!(analysis.price_low, Some(0.0));
        assert!(analysis.scope_gaps.is_empty());
    }

    #[test]
    fn scope_inputs_follow_contractor_order() {
        let (a, b) = (contractor("A"), contractor("B"));
        let items = vec![priced(&b, 1, "Tile", 10.0), priced(&a, 1, "Tile", 12.0)];
        let inputs = scope_inputs(&[a.clone(), b.clone()], &items);
        assert_eq!(inputs[0].contractor_name, "A");
        assert_eq!(inputs[1].contractor_name, "B");
    }
}
