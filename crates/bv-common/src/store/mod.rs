//! Relational persistence seam for the leveling pipeline.
//!
//! [`crate::db::PgBidStore`] backs production; [`MemoryStore`] backs tests
//! and local runs. Both keep the same ordering guarantees: documents in
//! upload order, items by document then `line_number`, history by `seq`.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::db::db_error;
use crate::model::{
    BidDocument, BreakdownTemplate, ComparisonResult, ConfidenceThreshold, CorrectionSample,
    ExtractedItem, ItemEditHistory, LevelingAssignment, LevelingConfig, PositionMap, Project,
    ProjectStatus,
};

pub use memory::MemoryStore;

db_error!(StoreError {
    #[error("failed to map stored row: {0}")]
    Mapping(String),
    #[error("referenced row is missing: {0}")]
    Missing(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
});

/// A history row before the store assigns its id, `seq` and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub field_name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub change_reason: Option<String>,
    pub batch_id: String,
}

#[async_trait]
pub trait BidStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError>;

    async fn is_organization_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Flip the project to `processing` unless it already is. Returns `false`
    /// when another run holds the project.
    async fn begin_analysis(&self, project_id: Uuid) -> Result<bool, StoreError>;

    async fn set_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn documents(&self, project_id: Uuid) -> Result<Vec<BidDocument>, StoreError>;

    async fn document(&self, document_id: Uuid) -> Result<Option<BidDocument>, StoreError>;

    /// Store extracted text and mark the document `processed`.
    async fn store_extracted_text(
        &self,
        document_id: Uuid,
        text: &str,
        positions: Option<&PositionMap>,
    ) -> Result<(), StoreError>;

    async fn mark_document_error(&self, document_id: Uuid, message: &str)
    -> Result<(), StoreError>;

    /// Delete every item of the document and insert `items` in one transaction.
    async fn replace_items(
        &self,
        document_id: Uuid,
        items: &[ExtractedItem],
    ) -> Result<(), StoreError>;

    async fn project_items(&self, project_id: Uuid) -> Result<Vec<ExtractedItem>, StoreError>;

    async fn item(&self, item_id: Uuid) -> Result<Option<ExtractedItem>, StoreError>;

    /// Persist the editable fields and `user_modified` of an existing item.
    async fn update_item(&self, item: &ExtractedItem) -> Result<(), StoreError>;

    async fn append_history(
        &self,
        entries: &[NewHistoryEntry],
    ) -> Result<Vec<ItemEditHistory>, StoreError>;

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<ItemEditHistory>, StoreError>;

    async fn comparison(&self, project_id: Uuid) -> Result<Option<ComparisonResult>, StoreError>;

    /// Replace the project's comparison. The stored leveling config is kept.
    async fn save_comparison(&self, result: &ComparisonResult) -> Result<(), StoreError>;

    /// Clear every baseline flag and leveled price of the project, then apply
    /// `assignments` and store `config`, all in one transaction. Returns the
    /// number of items given a baseline or leveled price.
    async fn apply_leveling(
        &self,
        project_id: Uuid,
        config: Option<&LevelingConfig>,
        assignments: &[LevelingAssignment],
    ) -> Result<u64, StoreError>;

    async fn threshold(&self, trade_type: &str) -> Result<Option<ConfidenceThreshold>, StoreError>;

    async fn thresholds(&self) -> Result<Vec<ConfidenceThreshold>, StoreError>;

    async fn upsert_threshold(&self, threshold: &ConfidenceThreshold) -> Result<(), StoreError>;

    async fn correction_samples(&self) -> Result<Vec<CorrectionSample>, StoreError>;

    async fn breakdown_templates(
        &self,
        trade_type: &str,
    ) -> Result<Vec<BreakdownTemplate>, StoreError>;

    async fn breakdown_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<BreakdownTemplate>, StoreError>;

    /// Attach the template to the project and bump its `use_count`.
    async fn select_breakdown_template(
        &self,
        project_id: Uuid,
        template_id: Uuid,
    ) -> Result<(), StoreError>;
}
