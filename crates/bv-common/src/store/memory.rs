use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BidStore, NewHistoryEntry, StoreError};
use crate::model::{
    BidDocument, BreakdownTemplate, ComparisonResult, ConfidenceThreshold, CorrectionSample,
    DocumentStatus, ExtractedItem, ItemEditHistory, LevelingAssignment, LevelingConfig,
    PositionMap, Project, ProjectStatus, trade_key,
};

#[derive(Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    members: HashSet<(Uuid, Uuid)>,
    // upload order
    documents: Vec<BidDocument>,
    items: Vec<ExtractedItem>,
    history: Vec<ItemEditHistory>,
    next_seq: i64,
    comparisons: HashMap<Uuid, ComparisonResult>,
    thresholds: HashMap<String, ConfidenceThreshold>,
    templates: Vec<BreakdownTemplate>,
    // samples with no item behind them, e.g. from archived projects
    archived_samples: Vec<CorrectionSample>,
}

/// In-process [`BidStore`] with the same ordering rules as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_history: AtomicBool,
    fail_items: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_project(&self, project: Project) {
        self.state.lock().await.projects.insert(project.id, project);
    }

    pub async fn insert_member(&self, organization_id: Uuid, user_id: Uuid) {
        self.state
            .lock()
            .await
            .members
            .insert((organization_id, user_id));
    }

    pub async fn insert_document(&self, document: BidDocument) {
        self.state.lock().await.documents.push(document);
    }

    pub async fn insert_items(&self, items: Vec<ExtractedItem>) {
        self.state.lock().await.items.extend(items);
    }

    pub async fn insert_template(&self, template: BreakdownTemplate) {
        self.state.lock().await.templates.push(template);
    }

    pub async fn insert_correction_samples(&self, samples: Vec<CorrectionSample>) {
        self.state.lock().await.archived_samples.extend(samples);
    }

    /// Make every subsequent `append_history` call fail.
    pub fn fail_history_writes(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `update_item` call fail.
    pub fn fail_item_writes(&self, fail: bool) {
        self.fail_items.store(fail, Ordering::SeqCst);
    }
}

fn missing(what: &str, id: Uuid) -> StoreError {
    StoreError::Missing(format!("{what} {id}"))
}

impl State {
    fn project_document_ids(&self, project_id: Uuid) -> Vec<Uuid> {
        self.documents
            .iter()
            .filter(|doc| doc.project_id == project_id)
            .map(|doc| doc.id)
            .collect()
    }

    fn document_mut(&mut self, document_id: Uuid) -> Result<&mut BidDocument, StoreError> {
        self.documents
            .iter_mut()
            .find(|doc| doc.id == document_id)
            .ok_or_else(|| missing("document", document_id))
    }
}

#[async_trait]
impl BidStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.state.lock().await.projects.get(&project_id).cloned())
    }

    async fn is_organization_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .contains(&(organization_id, user_id)))
    }

    async fn begin_analysis(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| missing("project", project_id))?;
        if project.status == ProjectStatus::Processing {
            return Ok(false);
        }
        project.status = ProjectStatus::Processing;
        project.status_message = None;
        project.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| missing("project", project_id))?;
        project.status = status;
        project.status_message = message.map(str::to_string);
        project.updated_at = Utc::now();
        Ok(())
    }

    async fn documents(&self, project_id: Uuid) -> Result<Vec<BidDocument>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .iter()
            .filter(|doc| doc.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn document(&self, document_id: Uuid) -> Result<Option<BidDocument>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .iter()
            .find(|doc| doc.id == document_id)
            .cloned())
    }

    async fn store_extracted_text(
        &self,
        document_id: Uuid,
        text: &str,
        positions: Option<&PositionMap>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let doc = state.document_mut(document_id)?;
        doc.raw_text = Some(text.to_string());
        doc.position_map = positions.cloned();
        doc.status = DocumentStatus::Processed;
        doc.status_message = None;
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_document_error(
        &self,
        document_id: Uuid,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let doc = state.document_mut(document_id)?;
        doc.status = DocumentStatus::Error;
        doc.status_message = Some(message.to_string());
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn replace_items(
        &self,
        document_id: Uuid,
        items: &[ExtractedItem],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.documents.iter().any(|doc| doc.id == document_id) {
            return Err(missing("document", document_id));
        }
        state.items.retain(|item| item.document_id != document_id);
        state.items.extend(items.iter().cloned());
        Ok(())
    }

    async fn project_items(&self, project_id: Uuid) -> Result<Vec<ExtractedItem>, StoreError> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for document_id in state.project_document_ids(project_id) {
            let mut items: Vec<ExtractedItem> = state
                .items
                .iter()
                .filter(|item| item.document_id == document_id)
                .cloned()
                .collect();
            items.sort_by_key(|item| item.line_number);
            out.extend(items);
        }
        Ok(out)
    }

    async fn item(&self, item_id: Uuid) -> Result<Option<ExtractedItem>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .iter()
            .find(|item| item.id == item_id)
            .cloned())
    }

    async fn update_item(&self, item: &ExtractedItem) -> Result<(), StoreError> {
        if self.fail_items.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("item writes disabled".into()));
        }
        let mut state = self.state.lock().await;
        let stored = state
            .items
            .iter_mut()
            .find(|stored| stored.id == item.id)
            .ok_or_else(|| missing("item", item.id))?;
        stored.description = item.description.clone();
        stored.category = item.category.clone();
        stored.quantity = item.quantity;
        stored.unit = item.unit.clone();
        stored.unit_price = item.unit_price;
        stored.total_price = item.total_price;
        stored.is_exclusion = item.is_exclusion;
        stored.is_inclusion = item.is_inclusion;
        stored.user_modified = item.user_modified;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn append_history(
        &self,
        entries: &[NewHistoryEntry],
    ) -> Result<Vec<ItemEditHistory>, StoreError> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("history writes disabled".into()));
        }
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            state.next_seq += 1;
            let row = ItemEditHistory {
                id: Uuid::new_v4(),
                seq: state.next_seq,
                item_id: entry.item_id,
                user_id: entry.user_id,
                field_name: entry.field_name.clone(),
                old_value: entry.old_value.clone(),
                new_value: entry.new_value.clone(),
                change_reason: entry.change_reason.clone(),
                batch_id: entry.batch_id.clone(),
                created_at: now,
            };
            state.history.push(row.clone());
            written.push(row);
        }
        Ok(written)
    }

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<ItemEditHistory>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .iter()
            .filter(|row| row.item_id == item_id)
            .cloned()
            .collect())
    }

    async fn comparison(&self, project_id: Uuid) -> Result<Option<ComparisonResult>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .comparisons
            .get(&project_id)
            .cloned())
    }

    async fn save_comparison(&self, result: &ComparisonResult) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = result.clone();
        if let Some(existing) = state.comparisons.get(&result.project_id) {
            next.leveling = existing.leveling.clone();
            next.created_at = existing.created_at;
        }
        next.updated_at = Utc::now();
        state.comparisons.insert(result.project_id, next);
        Ok(())
    }

    async fn apply_leveling(
        &self,
        project_id: Uuid,
        config: Option<&LevelingConfig>,
        assignments: &[LevelingAssignment],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let comparison_exists = state.comparisons.contains_key(&project_id);
        if !comparison_exists {
            return Err(missing("comparison for project", project_id));
        }
        let document_ids: HashSet<Uuid> =
            state.project_document_ids(project_id).into_iter().collect();
        let by_item: HashMap<Uuid, &LevelingAssignment> = assignments
            .iter()
            .map(|assignment| (assignment.item_id, assignment))
            .collect();

        let mut updated = 0u64;
        for item in state
            .items
            .iter_mut()
            .filter(|item| document_ids.contains(&item.document_id))
        {
            item.is_baseline = false;
            item.leveled_price = None;
            if let Some(assignment) = by_item.get(&item.id) {
                item.is_baseline = assignment.is_baseline;
                item.leveled_price = assignment.leveled_price;
                updated += 1;
            }
        }

        if let Some(comparison) = state.comparisons.get_mut(&project_id) {
            comparison.leveling = config.cloned();
            comparison.updated_at = Utc::now();
        }
        Ok(updated)
    }

    async fn threshold(&self, trade_type: &str) -> Result<Option<ConfidenceThreshold>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .thresholds
            .get(trade_type)
            .cloned())
    }

    async fn thresholds(&self) -> Result<Vec<ConfidenceThreshold>, StoreError> {
        let mut rows: Vec<ConfidenceThreshold> =
            self.state.lock().await.thresholds.values().cloned().collect();
        rows.sort_by(|a, b| a.trade_type.cmp(&b.trade_type));
        Ok(rows)
    }

    async fn upsert_threshold(&self, threshold: &ConfidenceThreshold) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .thresholds
            .insert(threshold.trade_type.clone(), threshold.clone());
        Ok(())
    }

    async fn correction_samples(&self) -> Result<Vec<CorrectionSample>, StoreError> {
        let state = self.state.lock().await;
        let corrected: HashSet<Uuid> = state.history.iter().map(|row| row.item_id).collect();
        let mut samples = state.archived_samples.clone();
        for doc in &state.documents {
            let Some(project) = state.projects.get(&doc.project_id) else {
                continue;
            };
            for item in state.items.iter().filter(|item| item.document_id == doc.id) {
                samples.push(CorrectionSample {
                    trade_type: project.trade_type.clone(),
                    confidence: item.confidence,
                    corrected: corrected.contains(&item.id),
                });
            }
        }
        Ok(samples)
    }

    async fn breakdown_templates(
        &self,
        trade_type: &str,
    ) -> Result<Vec<BreakdownTemplate>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .templates
            .iter()
            .filter(|template| trade_key(&template.trade_type) == trade_key(trade_type))
            .cloned()
            .collect())
    }

    async fn breakdown_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<BreakdownTemplate>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .templates
            .iter()
            .find(|template| template.id == template_id)
            .cloned())
    }

    async fn select_breakdown_template(
        &self,
        project_id: Uuid,
        template_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let template = state
            .templates
            .iter_mut()
            .find(|template| template.id == template_id)
            .ok_or_else(|| missing("template", template_id))?;
        template.use_count += 1;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| missing("project", project_id))?;
        project.breakdown_template_id = Some(template_id);
        project.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded_project() -> Project {
        Project::new(Uuid::new_v4(), "Lobby refresh", "flooring")
    }

    #[tokio::test]
    async fn begin_analysis_refuses_a_second_run() {
        let store = MemoryStore::new();
        let project = seeded_project();
        let id = project.id;
        store.insert_project(project).await;

        assert!(store.begin_analysis(id).await.unwrap());
        assert!(!store.begin_analysis(id).await.unwrap());

        store
            .set_project_status(id, ProjectStatus::Complete, None)
            .await
            .unwrap();
        assert!(store.begin_analysis(id).await.unwrap());
    }

    #[tokio::test]
    async fn history_seq_is_monotonic_across_items() {
        let store = MemoryStore::new();
        let entry = |item_id: Uuid| NewHistoryEntry {
            item_id,
            user_id: Uuid::new_v4(),
            field_name: "quantity".into(),
            old_value: json!(1.0),
            new_value: json!(2.0),
            change_reason: None,
            batch_id: "batch".into(),
        };
        let first = store.append_history(&[entry(Uuid::new_v4())]).await.unwrap();
        let second = store
            .append_history(&[entry(Uuid::new_v4()), entry(Uuid::new_v4())])
            .await
            .unwrap();
        assert_eq!(first[0].seq, 1);
        assert_eq!(second.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn replace_items_drops_previous_rows_of_the_document_only() {
        let store = MemoryStore::new();
        let project = seeded_project();
        let doc_a = BidDocument::new(project.id, "A", "a.pdf", "pdf");
        let doc_b = BidDocument::new(project.id, "B", "b.pdf", "pdf");
        let (a_id, b_id) = (doc_a.id, doc_b.id);
        let project_id = project.id;
        store.insert_project(project).await;
        store.insert_document(doc_a).await;
        store.insert_document(doc_b).await;
        store
            .insert_items(vec![
                ExtractedItem::new(a_id, 1, "old a"),
                ExtractedItem::new(b_id, 1, "keep b"),
            ])
            .await;

        store
            .replace_items(a_id, &[ExtractedItem::new(a_id, 1, "new a")])
            .await
            .unwrap();

        let descriptions: Vec<String> = store
            .project_items(project_id)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.description)
            .collect();
        assert_eq!(descriptions, vec!["new a", "keep b"]);
    }
}
