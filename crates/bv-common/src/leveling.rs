//! Leveling engine: baseline selections → per-item `is_baseline` and
//! `leveled_price`.
//!
//! Assignments are always computed from scratch; the store clears every
//! previous flag of the project in the same transaction that applies them.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{ExtractedItem, LevelingAssignment, LevelingConfig};
use crate::scope::{description_key, round_cents};

pub fn validate(config: &LevelingConfig, project_documents: &[Uuid]) -> Result<(), PipelineError> {
    if config.baselines.is_empty() {
        return Err(PipelineError::validation(
            "leveling needs at least one baseline; clear leveling to remove it",
        ));
    }
    let mut seen = HashSet::new();
    for (index, baseline) in config.baselines.iter().enumerate() {
        let key = description_key(&baseline.description);
        if key.is_empty() {
            return Err(PipelineError::validation(format!(
                "baselines[{index}].description is empty"
            )));
        }
        if !baseline.quantity.is_finite() || baseline.quantity < 0.0 {
            return Err(PipelineError::validation(format!(
                "baselines[{index}].quantity must be a finite number >= 0"
            )));
        }
        if !project_documents.contains(&baseline.reference_document_id) {
            return Err(PipelineError::validation(format!(
                "baselines[{index}].reference_document_id is not a document of this project"
            )));
        }
        if !seen.insert(key) {
            return Err(PipelineError::validation(format!(
                "baselines[{index}] repeats the description \"{}\"",
                baseline.description
            )));
        }
    }
    Ok(())
}

/// One assignment per project item whose description key equals a
/// baseline's key. Items of documents outside the project are ignored.
pub fn compute_assignments(
    config: &LevelingConfig,
    project_documents: &[Uuid],
    items: &[ExtractedItem],
) -> Vec<LevelingAssignment> {
    let baselines: HashMap<String, (f64, Uuid)> = config
        .baselines
        .iter()
        .map(|baseline| {
            (
                description_key(&baseline.description),
                (baseline.quantity, baseline.reference_document_id),
            )
        })
        .collect();

    items
        .iter()
        .filter(|item| project_documents.contains(&item.document_id))
        .filter_map(|item| {
            let (quantity, reference) = baselines.get(&description_key(&item.description))?;
            Some(LevelingAssignment {
                item_id: item.id,
                is_baseline: item.document_id == *reference,
                leveled_price: item.unit_price.map(|price| round_cents(quantity * price)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Baseline;

    fn item(document_id: Uuid, description: &str, unit_price: Option<f64>) -> ExtractedItem {
        let mut item = ExtractedItem::new(document_id, 1, description);
        item.quantity = Some(500.0);
        item.unit_price = unit_price;
        item
    }

    fn config(description: &str, quantity: f64, reference: Uuid) -> LevelingConfig {
        LevelingConfig {
            baselines: vec![Baseline {
                description: description.into(),
                quantity,
                reference_document_id: reference,
            }],
        }
    }

    #[test]
    fn leveled_price_is_baseline_quantity_times_unit_price() {
        let docs = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let items = vec![
            item(docs[0], "Demo existing flooring", Some(2.00)),
            item(docs[1], "demo. existing  flooring", Some(2.50)),
            item(docs[2], "Demo existing flooring", Some(1.80)),
            item(docs[2], "Install LVT", Some(4.00)),
            item(Uuid::new_v4(), "Demo existing flooring", Some(9.00)),
        ];
        let assignments =
            compute_assignments(&config("Demo existing flooring", 500.0, docs[2]), &docs, &items);

        let prices: Vec<Option<f64>> = assignments.iter().map(|a| a.leveled_price).collect();
        assert_eq!(prices, vec![Some(1000.0), Some(1250.0), Some(900.0)]);
        let baselines: Vec<bool> = assignments.iter().map(|a| a.is_baseline).collect();
        assert_eq!(baselines, vec![false, false, true]);
    }

    #[test]
    fn missing_unit_price_levels_to_null() {
        let doc = Uuid::new_v4();
        let assignments = compute_assignments(
            &config("Haul off", 3.0, doc),
            &[doc],
            &[item(doc, "Haul off", None)],
        );
        assert_eq!(assignments.len(), 1);
        assert!(assignments[0].is_baseline);
        assert_eq!(assignments[0].leveled_price, None);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let doc = Uuid::new_v4();
        let docs = [doc];
        assert!(validate(&config("Demo", 500.0, doc), &docs).is_ok());

        let rejected = [
            LevelingConfig { baselines: vec![] },
            config("  ", 1.0, doc),
            config("Demo", -1.0, doc),
            config("Demo", f64::INFINITY, doc),
            config("Demo", 1.0, Uuid::new_v4()),
        ];
        for bad in &rejected {
            assert!(matches!(validate(bad, &docs), Err(PipelineError::Validation(_))));
        }

        let mut duplicated = config("Demo existing flooring", 1.0, doc);
        duplicated.baselines.push(Baseline {
            description: "DEMO existing flooring.".into(),
            quantity: 2.0,
            reference_document_id: doc,
        });
        assert!(matches!(validate(&duplicated, &docs), Err(PipelineError::Validation(_))));
    }
}
