use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_postgres::Row;
use tokio_postgres::types::Json;
use tracing::instrument;
use uuid::Uuid;

use crate::db::PgPool;
use crate::db::util::TimedClientExt;
use crate::model::{
    BidDocument, BreakdownTemplate, ComparisonResult, ComparisonSummary, ConfidenceThreshold,
    ConfidenceTier, CorrectionSample, DocumentStatus, ExtractedItem, ItemEditHistory,
    LevelingAssignment, LevelingConfig, PositionMap, Project, ProjectStatus, Recommendation,
    ScopeGap, ScopeNode, trade_key,
};
use crate::store::{BidStore, NewHistoryEntry, StoreError};

const PROJECT_COLUMNS: &str = "id, user_id, organization_id, name, trade_type, status, \
     status_message, breakdown_template_id, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, project_id, contractor_name, file_ref, file_type, status, \
     status_message, raw_text, position_map, created_at, updated_at";

const ITEM_COLUMNS: &str = "i.id, i.document_id, i.line_number, i.description, i.category, \
     i.quantity, i.unit, i.unit_price, i.total_price, i.is_exclusion, i.is_inclusion, \
     i.confidence, i.confidence_tier, i.user_modified, i.is_baseline, i.leveled_price, \
     i.created_at, i.updated_at";

const HISTORY_COLUMNS: &str = "id, seq, item_id, user_id, field_name, old_value, new_value, \
     change_reason, batch_id, created_at";

/// Postgres-backed [`BidStore`] over the `bidvet` schema.
#[derive(Clone)]
pub struct PgBidStore {
    pool: PgPool,
}

impl PgBidStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn mapping(err: tokio_postgres::Error) -> StoreError {
    StoreError::Mapping(err.to_string())
}

fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> Result<Option<T>, StoreError> {
    let raw: Option<Value> = row.try_get(column).map_err(mapping)?;
    raw.map(|value| {
        serde_json::from_value(value)
            .map_err(|err| StoreError::Mapping(format!("{column}: {err}")))
    })
    .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Mapping(err.to_string()))
}

pub(crate) fn parse_project_status(raw: &str) -> Result<ProjectStatus, StoreError> {
    ProjectStatus::parse(raw)
        .ok_or_else(|| StoreError::Mapping(format!("unknown project status: {raw}")))
}

pub(crate) fn parse_document_status(raw: &str) -> Result<DocumentStatus, StoreError> {
    DocumentStatus::parse(raw)
        .ok_or_else(|| StoreError::Mapping(format!("unknown document status: {raw}")))
}

pub(crate) fn parse_confidence_tier(raw: &str) -> Result<ConfidenceTier, StoreError> {
    ConfidenceTier::parse(raw)
        .ok_or_else(|| StoreError::Mapping(format!("unknown confidence tier: {raw}")))
}

fn map_project(row: &Row) -> Result<Project, StoreError> {
    let status: String = row.try_get("status").map_err(mapping)?;
    Ok(Project {
        id: row.try_get("id").map_err(mapping)?,
        user_id: row.try_get("user_id").map_err(mapping)?,
        organization_id: row.try_get("organization_id").map_err(mapping)?,
        name: row.try_get("name").map_err(mapping)?,
        trade_type: row.try_get("trade_type").map_err(mapping)?,
        status: parse_project_status(&status)?,
        status_message: row.try_get("status_message").map_err(mapping)?,
        breakdown_template_id: row.try_get("breakdown_template_id").map_err(mapping)?,
        created_at: row.try_get("created_at").map_err(mapping)?,
        updated_at: row.try_get("updated_at").map_err(mapping)?,
    })
}

fn map_document(row: &Row) -> Result<BidDocument, StoreError> {
    let status: String = row.try_get("status").map_err(mapping)?;
    Ok(BidDocument {
        id: row.try_get("id").map_err(mapping)?,
        project_id: row.try_get("project_id").map_err(mapping)?,
        contractor_name: row.try_get("contractor_name").map_err(mapping)?,
        file_ref: row.try_get("file_ref").map_err(mapping)?,
        file_type: row.try_get("file_type").map_err(mapping)?,
        status: parse_document_status(&status)?,
        status_message: row.try_get("status_message").map_err(mapping)?,
        raw_text: row.try_get("raw_text").map_err(mapping)?,
        position_map: json_column::<PositionMap>(row, "position_map")?,
        created_at: row.try_get("created_at").map_err(mapping)?,
        updated_at: row.try_get("updated_at").map_err(mapping)?,
    })
}

fn map_item(row: &Row) -> Result<ExtractedItem, StoreError> {
    let tier: String = row.try_get("confidence_tier").map_err(mapping)?;
    Ok(ExtractedItem {
        id: row.try_get("id").map_err(mapping)?,
        document_id: row.try_get("document_id").map_err(mapping)?,
        line_number: row.try_get("line_number").map_err(mapping)?,
        description: row.try_get("description").map_err(mapping)?,
        category: row.try_get("category").map_err(mapping)?,
        quantity: row.try_get("quantity").map_err(mapping)?,
        unit: row.try_get("unit").map_err(mapping)?,
        unit_price: row.try_get("unit_price").map_err(mapping)?,
        total_price: row.try_get("total_price").map_err(mapping)?,
        is_exclusion: row.try_get("is_exclusion").map_err(mapping)?,
        is_inclusion: row.try_get("is_inclusion").map_err(mapping)?,
        confidence: row.try_get("confidence").map_err(mapping)?,
        confidence_tier: parse_confidence_tier(&tier)?,
        user_modified: row.try_get("user_modified").map_err(mapping)?,
        is_baseline: row.try_get("is_baseline").map_err(mapping)?,
        leveled_price: row.try_get("leveled_price").map_err(mapping)?,
        created_at: row.try_get("created_at").map_err(mapping)?,
        updated_at: row.try_get("updated_at").map_err(mapping)?,
    })
}

fn map_history(row: &Row) -> Result<ItemEditHistory, StoreError> {
    Ok(ItemEditHistory {
        id: row.try_get("id").map_err(mapping)?,
        seq: row.try_get("seq").map_err(mapping)?,
        item_id: row.try_get("item_id").map_err(mapping)?,
        user_id: row.try_get("user_id").map_err(mapping)?,
        field_name: row.try_get("field_name").map_err(mapping)?,
        old_value: row.try_get("old_value").map_err(mapping)?,
        new_value: row.try_get("new_value").map_err(mapping)?,
        change_reason: row.try_get("change_reason").map_err(mapping)?,
        batch_id: row.try_get("batch_id").map_err(mapping)?,
        created_at: row.try_get("created_at").map_err(mapping)?,
    })
}

fn map_comparison(row: &Row) -> Result<ComparisonResult, StoreError> {
    Ok(ComparisonResult {
        project_id: row.try_get("project_id").map_err(mapping)?,
        summary: json_column::<ComparisonSummary>(row, "summary_json")?.unwrap_or_default(),
        recommendation: json_column::<Recommendation>(row, "recommendation_json")?,
        price_low: row.try_get("price_low").map_err(mapping)?,
        price_high: row.try_get("price_high").map_err(mapping)?,
        price_average: row.try_get("price_average").map_err(mapping)?,
        leveling: json_column::<LevelingConfig>(row, "leveling_json")?,
        scope_gaps: json_column::<Vec<ScopeGap>>(row, "scope_gaps")?.unwrap_or_default(),
        analysis_run_id: row.try_get("analysis_run_id").map_err(mapping)?,
        created_at: row.try_get("created_at").map_err(mapping)?,
        updated_at: row.try_get("updated_at").map_err(mapping)?,
    })
}

fn map_template(row: &Row) -> Result<BreakdownTemplate, StoreError> {
    Ok(BreakdownTemplate {
        id: row.try_get("id").map_err(mapping)?,
        trade_type: row.try_get("trade_type").map_err(mapping)?,
        name: row.try_get("name").map_err(mapping)?,
        nodes: json_column::<Vec<ScopeNode>>(row, "nodes")?.unwrap_or_default(),
        use_count: row.try_get("use_count").map_err(mapping)?,
    })
}

fn map_threshold(row: &Row) -> Result<ConfidenceThreshold, StoreError> {
    Ok(ConfidenceThreshold {
        trade_type: row.try_get("trade_type").map_err(mapping)?,
        low: row.try_get("low").map_err(mapping)?,
        medium: row.try_get("medium").map_err(mapping)?,
        sample_count: row.try_get("sample_count").map_err(mapping)?,
        updated_at: row.try_get("updated_at").map_err(mapping)?,
    })
}

#[async_trait]
impl BidStore for PgBidStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.timed_execute("SELECT 1", &[], "ping").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM bidvet.projects WHERE id = $1");
        client
            .timed_query_opt(sql.as_str(), &[&project_id], "project")
            .await?
            .as_ref()
            .map(map_project)
            .transpose()
    }

    async fn is_organization_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .timed_query_opt(
                "SELECT 1 FROM bidvet.organization_members
                 WHERE organization_id = $1 AND user_id = $2",
                &[&organization_id, &user_id],
                "is_organization_member",
            )
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn begin_analysis(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let flipped = client
            .timed_execute(
                "UPDATE bidvet.projects
                 SET status = 'processing', status_message = NULL, updated_at = NOW()
                 WHERE id = $1 AND status <> 'processing'",
                &[&project_id],
                "begin_analysis",
            )
            .await?;
        if flipped == 1 {
            return Ok(true);
        }
        let exists = client
            .timed_query_opt(
                "SELECT 1 FROM bidvet.projects WHERE id = $1",
                &[&project_id],
                "begin_analysis_exists",
            )
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::Missing(format!("project {project_id}"))),
        }
    }

    #[instrument(skip(self))]
    async fn set_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .timed_execute(
                "UPDATE bidvet.projects
                 SET status = $2, status_message = $3, updated_at = NOW()
                 WHERE id = $1",
                &[&project_id, &status.as_str(), &message],
                "set_project_status",
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Missing(format!("project {project_id}")));
        }
        Ok(())
    }

    async fn documents(&self, project_id: Uuid) -> Result<Vec<BidDocument>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM bidvet.bid_documents
             WHERE project_id = $1
             ORDER BY created_at, id"
        );
        client
            .timed_query(sql.as_str(), &[&project_id], "documents")
            .await?
            .iter()
            .map(map_document)
            .collect()
    }

    async fn document(&self, document_id: Uuid) -> Result<Option<BidDocument>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM bidvet.bid_documents WHERE id = $1");
        client
            .timed_query_opt(sql.as_str(), &[&document_id], "document")
            .await?
            .as_ref()
            .map(map_document)
            .transpose()
    }

    #[instrument(skip(self, text, positions), fields(chars = text.len()))]
    async fn store_extracted_text(
        &self,
        document_id: Uuid,
        text: &str,
        positions: Option<&PositionMap>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let positions = positions.map(to_json).transpose()?;
        let updated = client
            .timed_execute(
                "UPDATE bidvet.bid_documents
                 SET raw_text = $2, position_map = $3, status = 'processed',
                     status_message = NULL, updated_at = NOW()
                 WHERE id = $1",
                &[&document_id, &text, &positions],
                "store_extracted_text",
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Missing(format!("document {document_id}")));
        }
        Ok(())
    }

    async fn mark_document_error(
        &self,
        document_id: Uuid,
        message: &str,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_execute(
                "UPDATE bidvet.bid_documents
                 SET status = 'error', status_message = $2, updated_at = NOW()
                 WHERE id = $1",
                &[&document_id, &message],
                "mark_document_error",
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, items), fields(item_count = items.len()))]
    async fn replace_items(
        &self,
        document_id: Uuid,
        items: &[ExtractedItem],
    ) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.timed_execute(
            "DELETE FROM bidvet.extracted_items WHERE document_id = $1",
            &[&document_id],
            "replace_items_delete",
        )
        .await?;

        let insert = tx
            .prepare(
                "INSERT INTO bidvet.extracted_items (
                    id, document_id, line_number, description, category, quantity, unit,
                    unit_price, total_price, is_exclusion, is_inclusion, confidence,
                    confidence_tier, user_modified, is_baseline, leveled_price
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            )
            .await?;
        for item in items {
            tx.timed_execute(
                &insert,
                &[
                    &item.id,
                    &document_id,
                    &item.line_number,
                    &item.description,
                    &item.category,
                    &item.quantity,
                    &item.unit,
                    &item.unit_price,
                    &item.total_price,
                    &item.is_exclusion,
                    &item.is_inclusion,
                    &item.confidence,
                    &item.confidence_tier.as_str(),
                    &item.user_modified,
                    &item.is_baseline,
                    &item.leveled_price,
                ],
                "replace_items_insert",
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn project_items(&self, project_id: Uuid) -> Result<Vec<ExtractedItem>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS}
             FROM bidvet.extracted_items i
             JOIN bidvet.bid_documents d ON d.id = i.document_id
             WHERE d.project_id = $1
             ORDER BY d.created_at, d.id, i.line_number"
        );
        client
            .timed_query(sql.as_str(), &[&project_id], "project_items")
            .await?
            .iter()
            .map(map_item)
            .collect()
    }

    async fn item(&self, item_id: Uuid) -> Result<Option<ExtractedItem>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {ITEM_COLUMNS} FROM bidvet.extracted_items i WHERE i.id = $1");
        client
            .timed_query_opt(sql.as_str(), &[&item_id], "item")
            .await?
            .as_ref()
            .map(map_item)
            .transpose()
    }

    #[instrument(skip(self, item), fields(item_id = %item.id))]
    async fn update_item(&self, item: &ExtractedItem) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .timed_execute(
                "UPDATE bidvet.extracted_items
                 SET description = $2, category = $3, quantity = $4, unit = $5,
                     unit_price = $6, total_price = $7, is_exclusion = $8,
                     is_inclusion = $9, user_modified = $10, updated_at = NOW()
                 WHERE id = $1",
                &[
                    &item.id,
                    &item.description,
                    &item.category,
                    &item.quantity,
                    &item.unit,
                    &item.unit_price,
                    &item.total_price,
                    &item.is_exclusion,
                    &item.is_inclusion,
                    &item.user_modified,
                ],
                "update_item",
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Missing(format!("item {}", item.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, entries), fields(rows = entries.len()))]
    async fn append_history(
        &self,
        entries: &[NewHistoryEntry],
    ) -> Result<Vec<ItemEditHistory>, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let sql = format!(
            "INSERT INTO bidvet.item_edit_history (
                id, item_id, user_id, field_name, old_value, new_value, change_reason, batch_id
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {HISTORY_COLUMNS}"
        );
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let rows = tx
                .timed_query(
                    sql.as_str(),
                    &[
                        &Uuid::new_v4(),
                        &entry.item_id,
                        &entry.user_id,
                        &entry.field_name,
                        &Json(&entry.old_value),
                        &Json(&entry.new_value),
                        &entry.change_reason,
                        &entry.batch_id,
                    ],
                    "append_history",
                )
                .await?;
            for row in &rows {
                written.push(map_history(row)?);
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<ItemEditHistory>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM bidvet.item_edit_history
             WHERE item_id = $1
             ORDER BY seq"
        );
        client
            .timed_query(sql.as_str(), &[&item_id], "item_history")
            .await?
            .iter()
            .map(map_history)
            .collect()
    }

    async fn comparison(&self, project_id: Uuid) -> Result<Option<ComparisonResult>, StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_query_opt(
                "SELECT project_id, summary_json, recommendation_json, price_low, price_high,
                        price_average, leveling_json, scope_gaps, analysis_run_id,
                        created_at, updated_at
                 FROM bidvet.comparison_results
                 WHERE project_id = $1",
                &[&project_id],
                "comparison",
            )
            .await?
            .as_ref()
            .map(map_comparison)
            .transpose()
    }

    #[instrument(skip(self, result), fields(project_id = %result.project_id))]
    async fn save_comparison(&self, result: &ComparisonResult) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let summary = to_json(&result.summary)?;
        let recommendation = result.recommendation.as_ref().map(to_json).transpose()?;
        let leveling = result.leveling.as_ref().map(to_json).transpose()?;
        let gaps = to_json(&result.scope_gaps)?;
        client
            .timed_execute(
                "INSERT INTO bidvet.comparison_results (
                    project_id, summary_json, recommendation_json, price_low, price_high,
                    price_average, leveling_json, scope_gaps, analysis_run_id
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (project_id) DO UPDATE SET
                    summary_json = EXCLUDED.summary_json,
                    recommendation_json = EXCLUDED.recommendation_json,
                    price_low = EXCLUDED.price_low,
                    price_high = EXCLUDED.price_high,
                    price_average = EXCLUDED.price_average,
                    scope_gaps = EXCLUDED.scope_gaps,
                    analysis_run_id = EXCLUDED.analysis_run_id,
                    updated_at = NOW()",
                &[
                    &result.project_id,
                    &summary,
                    &recommendation,
                    &result.price_low,
                    &result.price_high,
                    &result.price_average,
                    &leveling,
                    &gaps,
                    &result.analysis_run_id,
                ],
                "save_comparison",
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, config, assignments), fields(assignments = assignments.len()))]
    async fn apply_leveling(
        &self,
        project_id: Uuid,
        config: Option<&LevelingConfig>,
        assignments: &[LevelingAssignment],
    ) -> Result<u64, StoreError> {
        let leveling = config.map(to_json).transpose()?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let stored = tx
            .timed_execute(
                "UPDATE bidvet.comparison_results
                 SET leveling_json = $2, updated_at = NOW()
                 WHERE project_id = $1",
                &[&project_id, &leveling],
                "apply_leveling_config",
            )
            .await?;
        if stored == 0 {
            return Err(StoreError::Missing(format!(
                "comparison for project {project_id}"
            )));
        }

        tx.timed_execute(
            "UPDATE bidvet.extracted_items
             SET is_baseline = false, leveled_price = NULL
             WHERE document_id IN (
                 SELECT id FROM bidvet.bid_documents WHERE project_id = $1
             )",
            &[&project_id],
            "apply_leveling_clear",
        )
        .await?;

        let mut updated = 0u64;
        for assignment in assignments {
            updated += tx
                .timed_execute(
                    "UPDATE bidvet.extracted_items
                     SET is_baseline = $2, leveled_price = $3
                     WHERE id = $1 AND document_id IN (
                         SELECT id FROM bidvet.bid_documents WHERE project_id = $4
                     )",
                    &[
                        &assignment.item_id,
                        &assignment.is_baseline,
                        &assignment.leveled_price,
                        &project_id,
                    ],
                    "apply_leveling_item",
                )
                .await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn threshold(&self, trade_type: &str) -> Result<Option<ConfidenceThreshold>, StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_query_opt(
                "SELECT trade_type, low, medium, sample_count, updated_at
                 FROM bidvet.confidence_thresholds
                 WHERE trade_type = $1",
                &[&trade_type],
                "threshold",
            )
            .await?
            .as_ref()
            .map(map_threshold)
            .transpose()
    }

    async fn thresholds(&self) -> Result<Vec<ConfidenceThreshold>, StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_query(
                "SELECT trade_type, low, medium, sample_count, updated_at
                 FROM bidvet.confidence_thresholds
                 ORDER BY trade_type",
                &[],
                "thresholds",
            )
            .await?
            .iter()
            .map(map_threshold)
            .collect()
    }

    async fn upsert_threshold(&self, threshold: &ConfidenceThreshold) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated_at: DateTime<Utc> = threshold.updated_at;
        client
            .timed_execute(
                "INSERT INTO bidvet.confidence_thresholds (trade_type, low, medium, sample_count, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (trade_type) DO UPDATE SET
                    low = EXCLUDED.low,
                    medium = EXCLUDED.medium,
                    sample_count = EXCLUDED.sample_count,
                    updated_at = EXCLUDED.updated_at",
                &[
                    &threshold.trade_type,
                    &threshold.low,
                    &threshold.medium,
                    &threshold.sample_count,
                    &updated_at,
                ],
                "upsert_threshold",
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn correction_samples(&self) -> Result<Vec<CorrectionSample>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .timed_query(
                "SELECT p.trade_type, i.confidence,
                        EXISTS (
                            SELECT 1 FROM bidvet.item_edit_history h WHERE h.item_id = i.id
                        ) AS corrected
                 FROM bidvet.extracted_items i
                 JOIN bidvet.bid_documents d ON d.id = i.document_id
                 JOIN bidvet.projects p ON p.id = d.project_id",
                &[],
                "correction_samples",
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CorrectionSample {
                    trade_type: row.try_get("trade_type").map_err(mapping)?,
                    confidence: row.try_get("confidence").map_err(mapping)?,
                    corrected: row.try_get("corrected").map_err(mapping)?,
                })
            })
            .collect()
    }

    async fn breakdown_templates(
        &self,
        trade_type: &str,
    ) -> Result<Vec<BreakdownTemplate>, StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_query(
                "SELECT id, trade_type, name, nodes, use_count
                 FROM bidvet.breakdown_templates
                 WHERE lower(btrim(trade_type)) = $1",
                &[&trade_key(trade_type)],
                "breakdown_templates",
            )
            .await?
            .iter()
            .map(map_template)
            .collect()
    }

    async fn breakdown_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<BreakdownTemplate>, StoreError> {
        let client = self.pool.get().await?;
        client
            .timed_query_opt(
                "SELECT id, trade_type, name, nodes, use_count
                 FROM bidvet.breakdown_templates
                 WHERE id = $1",
                &[&template_id],
                "breakdown_template",
            )
            .await?
            .as_ref()
            .map(map_template)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn select_breakdown_template(
        &self,
        project_id: Uuid,
        template_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let bumped = tx
            .timed_execute(
                "UPDATE bidvet.breakdown_templates SET use_count = use_count + 1 WHERE id = $1",
                &[&template_id],
                "select_breakdown_bump",
            )
            .await?;
        if bumped == 0 {
            return Err(StoreError::Missing(format!("template {template_id}")));
        }
        let attached = tx
            .timed_execute(
                "UPDATE bidvet.projects
                 SET breakdown_template_id = $2, updated_at = NOW()
                 WHERE id = $1",
                &[&project_id, &template_id],
                "select_breakdown_attach",
            )
            .await?;
        if attached == 0 {
            return Err(StoreError::Missing(format!("project {project_id}")));
        }
        tx.commit().await?;
        Ok(())
    }
}
