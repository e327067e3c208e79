//! Edit/audit ledger over extracted items.
//!
//! Every user change is a field-level diff written as one item update plus
//! one history row per changed field, all sharing a batch id. Reverts are
//! batches too, so the log only ever grows. History writes happen after the
//! item update and a failure there is logged, never returned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::ExtractedItem;
use crate::run_id;
use crate::store::{BidStore, NewHistoryEntry};

pub const EDITABLE_FIELDS: &[&str] = &[
    "description",
    "category",
    "quantity",
    "unit",
    "unit_price",
    "total_price",
    "is_exclusion",
    "is_inclusion",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub changed: bool,
    pub changed_fields: Vec<String>,
    /// `None` when nothing changed.
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RevertTarget {
    Batch { batch_id: String },
    Field { field_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertOutcome {
    pub reverted_fields: Vec<String>,
    pub revert_batch_id: String,
}

/// Canonical JSON value of an editable field.
pub fn field_value(item: &ExtractedItem, field: &str) -> Option<Value> {
    Some(match field {
        "description" => json!(item.description),
        "category" => json!(item.category),
        "quantity" => json!(item.quantity),
        "unit" => json!(item.unit),
        "unit_price" => json!(item.unit_price),
        "total_price" => json!(item.total_price),
        "is_exclusion" => json!(item.is_exclusion),
        "is_inclusion" => json!(item.is_inclusion),
        _ => return None,
    })
}

fn optional_text(field: &str, value: &Value) -> Result<Option<String>, PipelineError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => {
            let text = text.trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        _ => Err(PipelineError::validation(format!(
            "{field} must be a string or null"
        ))),
    }
}

fn optional_amount(field: &str, value: &Value) -> Result<Option<f64>, PipelineError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => match number.as_f64() {
            Some(amount) if amount.is_finite() && amount >= 0.0 => Ok(Some(amount)),
            _ => Err(PipelineError::validation(format!(
                "{field} must be a finite number >= 0"
            ))),
        },
        _ => Err(PipelineError::validation(format!(
            "{field} must be a number or null"
        ))),
    }
}

fn flag(field: &str, value: &Value) -> Result<bool, PipelineError> {
    value
        .as_bool()
        .ok_or_else(|| PipelineError::validation(format!("{field} must be a boolean")))
}

/// Write `value` into `field`, rejecting unknown fields and wrong types.
pub fn apply_field(
    item: &mut ExtractedItem,
    field: &str,
    value: &Value,
) -> Result<(), PipelineError> {
    match field {
        "description" => {
            item.description = optional_text(field, value)?
                .ok_or_else(|| PipelineError::validation("description must not be empty"))?;
        }
        "category" => item.category = optional_text(field, value)?,
        "unit" => item.unit = optional_text(field, value)?,
        "quantity" => item.quantity = optional_amount(field, value)?,
        "unit_price" => item.unit_price = optional_amount(field, value)?,
        "total_price" => item.total_price = optional_amount(field, value)?,
        "is_exclusion" => item.is_exclusion = flag(field, value)?,
        "is_inclusion" => item.is_inclusion = flag(field, value)?,
        other => {
            return Err(PipelineError::validation(format!(
                "{other} is not an editable field"
            )));
        }
    }
    Ok(())
}

async fn write_history(store: &dyn BidStore, item_id: Uuid, entries: &[NewHistoryEntry]) {
    if let Err(err) = store.append_history(entries).await {
        warn!(
            %item_id,
            rows = entries.len(),
            error = %err,
            "history write failed; item change is kept"
        );
    }
}

/// Apply `patch` to `item` and log the fields that actually changed.
#[instrument(skip(store, item, patch), fields(item_id = %item.id))]
pub async fn edit(
    store: &dyn BidStore,
    item: &ExtractedItem,
    user_id: Uuid,
    patch: &Map<String, Value>,
    reason: Option<&str>,
) -> Result<EditOutcome, PipelineError> {
    if patch.is_empty() {
        return Err(PipelineError::validation("patch has no fields"));
    }

    let mut updated = item.clone();
    for (field, value) in patch {
        apply_field(&mut updated, field, value)?;
    }

    let mut changes = Vec::new();
    for field in EDITABLE_FIELDS.iter().filter(|field| patch.contains_key(**field)) {
        let before = field_value(item, field).unwrap_or(Value::Null);
        let after = field_value(&updated, field).unwrap_or(Value::Null);
        if before != after {
            changes.push((field.to_string(), before, after));
        }
    }

    if changes.is_empty() {
        return Ok(EditOutcome {
            changed: false,
            changed_fields: Vec::new(),
            batch_id: None,
        });
    }

    updated.user_modified = true;
    store.update_item(&updated).await?;

    let batch_id = run_id::batch_id();
    let reason = reason.map(str::trim).filter(|text| !text.is_empty());
    let entries: Vec<NewHistoryEntry> = changes
        .iter()
        .map(|(field, before, after)| NewHistoryEntry {
            item_id: item.id,
            user_id,
            field_name: field.clone(),
            old_value: before.clone(),
            new_value: after.clone(),
            change_reason: reason.map(str::to_string),
            batch_id: batch_id.clone(),
        })
        .collect();
    write_history(store, item.id, &entries).await;

    let changed_fields: Vec<String> = changes.into_iter().map(|(field, _, _)| field).collect();
    info!(%batch_id, fields = ?changed_fields, "item edited");
    Ok(EditOutcome {
        changed: true,
        changed_fields,
        batch_id: Some(batch_id),
    })
}

/// Put back the old values of a batch, or of the latest change to one
/// field, and log the revert as a new batch. Each row records the value the
/// item held right before the revert and the value put back.
#[instrument(skip(store, item), fields(item_id = %item.id))]
pub async fn revert(
    store: &dyn BidStore,
    item: &ExtractedItem,
    user_id: Uuid,
    target: &RevertTarget,
) -> Result<RevertOutcome, PipelineError> {
    let history = store.item_history(item.id).await?;
    let rows: Vec<_> = match target {
        RevertTarget::Batch { batch_id } => history
            .into_iter()
            .filter(|row| &row.batch_id == batch_id)
            .collect(),
        RevertTarget::Field { field_name } => history
            .into_iter()
            .rev()
            .find(|row| &row.field_name == field_name)
            .into_iter()
            .collect(),
    };
    if rows.is_empty() {
        return Err(match target {
            RevertTarget::Batch { batch_id } => {
                PipelineError::not_found(format!("history batch {batch_id}"))
            }
            RevertTarget::Field { field_name } => {
                PipelineError::not_found(format!("history for field {field_name}"))
            }
        });
    }

    let mut updated = item.clone();
    for row in rows.iter().rev() {
        apply_field(&mut updated, &row.field_name, &row.old_value)?;
    }
    updated.user_modified = true;
    store.update_item(&updated).await?;

    let revert_batch_id = run_id::batch_id();
    let reason = match target {
        RevertTarget::Batch { batch_id } => format!("revert of batch {batch_id}"),
        RevertTarget::Field { field_name } => format!("revert of {field_name}"),
    };
    let entries: Vec<NewHistoryEntry> = rows
        .iter()
        .map(|row| NewHistoryEntry {
            item_id: item.id,
            user_id,
            field_name: row.field_name.clone(),
            old_value: field_value(item, &row.field_name).unwrap_or(Value::Null),
            new_value: field_value(&updated, &row.field_name).unwrap_or(Value::Null),
            change_reason: Some(reason.clone()),
            batch_id: revert_batch_id.clone(),
        })
        .collect();
    write_history(store, item.id, &entries).await;

    let reverted_fields: Vec<String> = rows.into_iter().map(|row| row.field_name).collect();
    info!(%revert_batch_id, fields = ?reverted_fields, "item reverted");
    Ok(RevertOutcome {
        reverted_fields,
        revert_batch_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BidDocument, Project};
    use crate::store::MemoryStore;

    async fn seeded() -> (MemoryStore, ExtractedItem) {
        let store = MemoryStore::new();
        let project = Project::new(Uuid::new_v4(), "Lobby", "flooring");
        let document = BidDocument::new(project.id, "Acme", "a.pdf", "pdf");
        let mut item = ExtractedItem::new(document.id, 1, "Demo existing flooring");
        item.quantity = Some(500.0);
        item.unit = Some("SF".into());
        item.unit_price = Some(2.0);
        item.total_price = Some(1000.0);
        store.insert_project(project).await;
        store.insert_document(document).await;
        store.insert_items(vec![item.clone()]).await;
        (store, item)
    }

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn unchanged_values_write_nothing() {
        let (store, item) = seeded().await;
        let outcome = edit(
            &store,
            &item,
            Uuid::new_v4(),
            &patch(json!({"quantity": 500, "unit": " SF ", "is_exclusion": false})),
            Some("typo"),
        )
        .await
        .unwrap();

        assert!(!outcome.changed);
        assert!(outcome.changed_fields.is_empty());
        assert_eq!(outcome.batch_id, None);
        assert!(store.item_history(item.id).await.unwrap().is_empty());
        assert!(!store.item(item.id).await.unwrap().unwrap().user_modified);
    }

    #[tokio::test]
    async fn one_history_row_per_changed_field_sharing_a_batch() {
        let (store, item) = seeded().await;
        let outcome = edit(
            &store,
            &item,
            Uuid::new_v4(),
            &patch(json!({"quantity": 450, "unit_price": 2.0, "total_price": 900, "category": "Demo"})),
            Some("field measure"),
        )
        .await
        .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.changed_fields, vec!["category", "quantity", "total_price"]);
        let history = store.item_history(item.id).await.unwrap();
        assert_eq!(history.len(), 3);
        let batch = outcome.batch_id.unwrap();
        assert!(history.iter().all(|row| row.batch_id == batch));
        assert_eq!(history[1].old_value, json!(500.0));
        assert_eq!(history[1].new_value, json!(450.0));
        assert_eq!(history[0].change_reason.as_deref(), Some("field measure"));

        let stored = store.item(item.id).await.unwrap().unwrap();
        assert!(stored.user_modified);
        assert_eq!(stored.quantity, Some(450.0));
    }

    #[tokio::test]
    async fn batch_revert_restores_values_and_logs_the_swap() {
        let (store, item) = seeded().await;
        let user = Uuid::new_v4();
        let edited = edit(
            &store,
            &item,
            user,
            &patch(json!({"description": "Demo flooring", "unit": null, "is_exclusion": true})),
            None,
        )
        .await
        .unwrap();
        let batch_id = edited.batch_id.unwrap();

        let current = store.item(item.id).await.unwrap().unwrap();
        let reverted = revert(
            &store,
            &current,
            user,
            &RevertTarget::Batch {
                batch_id: batch_id.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reverted.reverted_fields, edited.changed_fields);
        assert_ne!(reverted.revert_batch_id, batch_id);

        let restored = store.item(item.id).await.unwrap().unwrap();
        assert_eq!(restored.description, "Demo existing flooring");
        assert_eq!(restored.unit.as_deref(), Some("SF"));
        assert!(!restored.is_exclusion);

        let history = store.item_history(item.id).await.unwrap();
        let (original, revert_rows): (Vec<_>, Vec<_>) =
            history.into_iter().partition(|row| row.batch_id == batch_id);
        assert_eq!(original.len(), 3);
        assert_eq!(revert_rows.len(), 3);
        for (before, after) in original.iter().zip(&revert_rows) {
            assert_eq!(before.field_name, after.field_name);
            assert_eq!(before.old_value, after.new_value);
            assert_eq!(before.new_value, after.old_value);
            assert_eq!(after.batch_id, reverted.revert_batch_id);
        }
    }

    #[tokio::test]
    async fn field_revert_takes_the_latest_change_only() {
        let (store, item) = seeded().await;
        let user = Uuid::new_v4();
        edit(&store, &item, user, &patch(json!({"unit_price": 2.25})), None)
            .await
            .unwrap();
        let current = store.item(item.id).await.unwrap().unwrap();
        edit(&store, &current, user, &patch(json!({"unit_price": 2.5})), None)
            .await
            .unwrap();

        let current = store.item(item.id).await.unwrap().unwrap();
        let outcome = revert(
            &store,
            &current,
            user,
            &RevertTarget::Field {
                field_name: "unit_price".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.reverted_fields, vec!["unit_price"]);
        assert_eq!(store.item(item.id).await.unwrap().unwrap().unit_price, Some(2.25));
        assert_eq!(store.item_history(item.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn revert_after_a_later_edit_logs_the_value_it_replaced() {
        let (store, item) = seeded().await;
        let user = Uuid::new_v4();
        let first = edit(&store, &item, user, &patch(json!({"quantity": 480})), None)
            .await
            .unwrap();
        let current = store.item(item.id).await.unwrap().unwrap();
        edit(&store, &current, user, &patch(json!({"quantity": 450})), None)
            .await
            .unwrap();

        let current = store.item(item.id).await.unwrap().unwrap();
        revert(
            &store,
            &current,
            user,
            &RevertTarget::Batch {
                batch_id: first.batch_id.unwrap(),
            },
        )
        .await
        .unwrap();
        assert_eq!(store.item(item.id).await.unwrap().unwrap().quantity, Some(500.0));

        let history = store.item_history(item.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].old_value, history[1].new_value);
        assert_eq!(history[2].new_value, history[0].old_value);
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let (store, item) = seeded().await;
        let by_batch = revert(
            &store,
            &item,
            Uuid::new_v4(),
            &RevertTarget::Batch {
                batch_id: "01J0000000000000000000000".into(),
            },
        )
        .await;
        assert!(matches!(by_batch, Err(PipelineError::NotFound(_))));

        let by_field = revert(
            &store,
            &item,
            Uuid::new_v4(),
            &RevertTarget::Field {
                field_name: "unit".into(),
            },
        )
        .await;
        assert!(matches!(by_field, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_patches_are_rejected_before_any_write() {
        let (store, item) = seeded().await;
        for bad in [
            json!({}),
            json!({"confidence": 1.0}),
            json!({"description": "   "}),
            json!({"quantity": "500"}),
            json!({"unit_price": -1}),
            json!({"is_exclusion": "yes"}),
        ] {
            let result = edit(&store, &item, Uuid::new_v4(), &patch(bad), None).await;
            assert!(matches!(result, Err(PipelineError::Validation(_))));
        }
        assert!(store.item_history(item.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_failures_do_not_undo_the_edit() {
        let (store, item) = seeded().await;
        store.fail_history_writes(true);
        let outcome = edit(&store, &item, Uuid::new_v4(), &patch(json!({"quantity": 10})), None)
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(store.item(item.id).await.unwrap().unwrap().quantity, Some(10.0));
        store.fail_history_writes(false);
        assert!(store.item_history(item.id).await.unwrap().is_empty());
    }

    #[test]
    fn revert_target_reads_either_shape() {
        let batch: RevertTarget = serde_json::from_value(json!({"batch_id": "b1"})).unwrap();
        assert_eq!(batch, RevertTarget::Batch { batch_id: "b1".into() });
        let field: RevertTarget = serde_json::from_value(json!({"field_name": "unit"})).unwrap();
        assert_eq!(field, RevertTarget::Field { field_name: "unit".into() });
    }
}
