//! Transport-independent operations of the leveling pipeline.
//!
//! Every operation that names a project or item checks that the caller owns
//! the project or belongs to its organization before touching anything.
//! Project status is the single completion signal for analysis runs.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::breakdown;
use crate::calibration::{self, CalibrationConfig, CalibrationReport};
use crate::error::PipelineError;
use crate::items;
use crate::ledger::{self, EditOutcome, RevertOutcome, RevertTarget};
use crate::leveling;
use crate::llm::{LlmClient, LlmError, RecommendationDraft};
use crate::model::{
    BidDocument, BreakdownOption, ComparisonResult, ConfidenceTier, ContractorRef,
    ContractorRollup, DocumentStatus, ExtractedItem, ItemEditHistory, LevelingConfig, Project,
    ProjectStatus, Recommendation, ReviewRequirement, trade_key,
};
use crate::run_id;
use crate::scope::{self, MatchConfig, NormalizationMode};
use crate::storage::ObjectStorage;
use crate::store::{BidStore, StoreError};
use crate::text::{self, DocumentFormat, TextExtractionError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub matching: MatchConfig,
    pub calibration: CalibrationConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            matching: MatchConfig::from_env(),
            calibration: CalibrationConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentTextStatus {
    Processed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTextResult {
    pub document_id: Uuid,
    pub contractor_name: String,
    pub status: DocumentTextStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub characters: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractTextReport {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub documents: Vec<DocumentTextResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStarted {
    pub started: bool,
    pub analysis_run_id: String,
}

/// A submitted analysis. Dropping it detaches the run; awaiting
/// [`AnalysisRun::wait`] yields the final project status.
pub struct AnalysisRun {
    pub analysis_run_id: String,
    handle: JoinHandle<ProjectStatus>,
}

impl AnalysisRun {
    pub fn started(&self) -> AnalysisStarted {
        AnalysisStarted {
            started: true,
            analysis_run_id: self.analysis_run_id.clone(),
        }
    }

    pub async fn wait(self) -> Result<ProjectStatus, PipelineError> {
        self.handle
            .await
            .map_err(|err| PipelineError::Internal(format!("analysis task lost: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelingOutcome {
    pub updated_item_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatusView {
    pub document_id: Uuid,
    pub contractor_name: String,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub has_text: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatusView {
    pub project_id: Uuid,
    pub status: ProjectStatus,
    pub status_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub documents: Vec<DocumentStatusView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub review: ReviewRequirement,
    pub contractor_name: String,
    pub item: ExtractedItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownSelection {
    pub template_id: Uuid,
    pub seed_labels: Vec<String>,
}

fn recommendation_from(
    draft: RecommendationDraft,
    rollups: &[ContractorRollup],
) -> Result<Recommendation, LlmError> {
    let wanted = draft.contractor_name.trim();
    let rollup = rollups
        .iter()
        .find(|rollup| rollup.contractor_name.trim().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| {
            LlmError::parse(format!(
                "recommended contractor \"{wanted}\" is not one of the analyzed bids"
            ))
        })?;
    let confidence_tier = ConfidenceTier::parse(&draft.confidence_tier).ok_or_else(|| {
        LlmError::parse(format!(
            "recommendation tier \"{}\" is not low, medium or high",
            draft.confidence_tier
        ))
    })?;
    Ok(Recommendation {
        contractor_name: rollup.contractor_name.clone(),
        document_id: Some(rollup.document_id),
        confidence_tier,
        reasoning: draft.reasoning.trim().to_string(),
    })
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn BidStore>,
    storage: Arc<dyn ObjectStorage>,
    llm: Arc<dyn LlmClient>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn BidStore>,
        storage: Arc<dyn ObjectStorage>,
        llm: Arc<dyn LlmClient>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            storage,
            llm,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn BidStore> {
        &self.store
    }

    async fn authorized_project(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<Project, PipelineError> {
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("project {project_id}")))?;
        if project.user_id == actor {
            return Ok(project);
        }
        if let Some(organization_id) = project.organization_id {
            if self
                .store
                .is_organization_member(organization_id, actor)
                .await?
            {
                return Ok(project);
            }
        }
        Err(PipelineError::Forbidden(format!("project {project_id}")))
    }

    fn ensure_idle(project: &Project) -> Result<(), PipelineError> {
        if project.status == ProjectStatus::Processing {
            return Err(PipelineError::conflict(format!(
                "project {} is being analyzed; try again when it finishes",
                project.id
            )));
        }
        Ok(())
    }

    /// Item plus its project, after the ownership check.
    async fn authorized_item(
        &self,
        actor: Uuid,
        item_id: Uuid,
    ) -> Result<(ExtractedItem, Project), PipelineError> {
        let item = self
            .store
            .item(item_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("item {item_id}")))?;
        let document = self
            .store
            .document(item.document_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("document {}", item.document_id)))?;
        let project = self.authorized_project(actor, document.project_id).await?;
        Ok((item, project))
    }

    async fn extract_one(&self, document: &BidDocument) -> Result<usize, TextExtractionError> {
        let format = DocumentFormat::detect(&document.file_type, &document.file_ref)?;
        let bytes = self
            .storage
            .get_file(&document.file_ref)
            .await
            .map_err(|err| TextExtractionError::SourceUnavailable(err.to_string()))?;
        let extracted = text::extract_blocking(format, bytes).await?;
        self.store
            .store_extracted_text(document.id, &extracted.text, extracted.positions.as_ref())
            .await
            .map_err(|err| TextExtractionError::ExtractionFailed(err.to_string()))?;
        Ok(extracted.text.chars().count())
    }

    /// Pull raw text out of every document that has none yet, one document
    /// at a time. A failing document is marked `error` and the rest go on.
    #[instrument(skip(self))]
    pub async fn extract_text(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<ExtractTextReport, PipelineError> {
        self.authorized_project(actor, project_id).await?;
        let documents = self.store.documents(project_id).await?;

        let mut report = ExtractTextReport::default();
        for document in documents {
            let mut result = DocumentTextResult {
                document_id: document.id,
                contractor_name: document.contractor_name.clone(),
                status: DocumentTextStatus::Skipped,
                message: None,
                characters: document.raw_text.as_deref().map_or(0, |t| t.chars().count()),
            };

            if document.has_text() {
                report.skipped += 1;
            } else {
                match self.extract_one(&document).await {
                    Ok(characters) => {
                        info!(document_id = %document.id, characters, "text extracted");
                        result.status = DocumentTextStatus::Processed;
                        result.characters = characters;
                        report.processed += 1;
                    }
                    Err(err) => {
                        let message = err.to_string();
                        warn!(document_id = %document.id, error = %message, "text extraction failed");
                        self.store.mark_document_error(document.id, &message).await?;
                        result.status = DocumentTextStatus::Error;
                        result.message = Some(message);
                        report.errors += 1;
                    }
                }
            }
            report.documents.push(result);
        }

        metrics::counter!("bidvet_documents_extracted_total", "status" => "processed")
            .increment(report.processed as u64);
        metrics::counter!("bidvet_documents_extracted_total", "status" => "error")
            .increment(report.errors as u64);
        Ok(report)
    }

    /// Flip the project to `processing` and run item extraction, matching
    /// and the recommendation on a background task.
    #[instrument(skip(self))]
    pub async fn analyze(&self, actor: Uuid, project_id: Uuid) -> Result<AnalysisRun, PipelineError> {
        let project = self.authorized_project(actor, project_id).await?;
        let documents = self.store.documents(project_id).await?;
        if !documents.iter().any(BidDocument::has_text) {
            return Err(PipelineError::validation(
                "no document has extracted text; run text extraction first",
            ));
        }
        if !self.store.begin_analysis(project_id).await? {
            return Err(PipelineError::conflict(format!(
                "project {project_id} is already being analyzed"
            )));
        }

        let analysis_run_id = run_id::analysis_run_id();
        let span = info_span!("analysis", %project_id, run_id = %analysis_run_id);
        let pipeline = self.clone();
        let run_id = analysis_run_id.clone();
        let handle = tokio::spawn(
            async move {
                let inner = tokio::spawn({
                    let pipeline = pipeline.clone();
                    async move { pipeline.run_analysis(project, run_id).await }
                });
                let outcome = match inner.await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(PipelineError::Internal(format!("analysis task failed: {err}"))),
                };
                pipeline.finish_analysis(project_id, outcome).await
            }
            .instrument(span),
        );

        Ok(AnalysisRun {
            analysis_run_id,
            handle,
        })
    }

    async fn finish_analysis(
        &self,
        project_id: Uuid,
        outcome: Result<(), PipelineError>,
    ) -> ProjectStatus {
        let (status, message) = match &outcome {
            Ok(()) => (ProjectStatus::Complete, None),
            Err(err) => (ProjectStatus::Error, Some(err.to_string())),
        };
        metrics::counter!("bidvet_analysis_runs_total", "status" => status.as_str()).increment(1);
        match &message {
            None => info!("analysis complete"),
            Some(message) => warn!(error = %message, "analysis failed"),
        }
        if let Err(err) = self
            .store
            .set_project_status(project_id, status, message.as_deref())
            .await
        {
            error!(error = %err, "could not record analysis outcome");
        }
        status
    }

    async fn run_analysis(&self, project: Project, analysis_run_id: String) -> Result<(), PipelineError> {
        let started = Instant::now();
        let documents: Vec<BidDocument> = self
            .store
            .documents(project.id)
            .await?
            .into_iter()
            .filter(BidDocument::has_text)
            .collect();
        let threshold = items::thresholds_for(self.store.as_ref(), &project.trade_type).await?;

        let mut first_failure: Option<LlmError> = None;
        for document in &documents {
            let extracted = items::extract_document_items(
                self.store.as_ref(),
                self.llm.as_ref(),
                document,
                &project.trade_type,
                &threshold,
            )
            .await;
            match extracted {
                Ok(_) => {}
                Err(PipelineError::Llm(err)) => {
                    warn!(document_id = %document.id, kind = err.kind.as_str(), error = %err.message, "item extraction failed");
                    if first_failure.is_none() {
                        first_failure = Some(LlmError::new(
                            err.kind,
                            format!("{}: {}", document.contractor_name, err.message),
                        ));
                    }
                }
                Err(other) => return Err(other),
            }
        }
        if let Some(failure) = first_failure {
            // Sibling documents already lost their flags in `replace_items`.
            if let Some(config) = self.stored_leveling(project.id).await? {
                let updated = self.reapply_leveling(project.id, &config).await?;
                info!(updated, "stored leveling reapplied after failed run");
            }
            return Err(failure.into());
        }

        let contractors: Vec<ContractorRef> = documents.iter().map(BidDocument::contractor).collect();
        let items = self.store.project_items(project.id).await?;
        let seeds = self.seed_labels(&project).await?;
        let buckets = match self.config.matching.mode {
            NormalizationMode::Similarity => {
                scope::bucket_by_similarity(&contractors, &items, &seeds, &self.config.matching)
            }
            NormalizationMode::Llm => {
                let inputs = scope::scope_inputs(&contractors, &items);
                let proposals = self.llm.normalize(&project.trade_type, &inputs).await?;
                scope::enforce_proposals(&contractors, &items, proposals)
            }
        };

        let analysis = scope::analyze_scope(&contractors, &items, &buckets);
        let summary = analysis.summary(&project.trade_type);
        let draft = self.llm.recommend(&summary).await?;
        let recommendation = recommendation_from(draft, &summary.contractors)?;

        let stored_leveling = self.stored_leveling(project.id).await?;
        let now = Utc::now();
        self.store
            .save_comparison(&ComparisonResult {
                project_id: project.id,
                summary,
                recommendation: Some(recommendation),
                price_low: analysis.price_low,
                price_high: analysis.price_high,
                price_average: analysis.price_average,
                leveling: None,
                scope_gaps: analysis.scope_gaps,
                analysis_run_id: Some(analysis_run_id),
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Some(config) = stored_leveling {
            let updated = self.reapply_leveling(project.id, &config).await?;
            info!(updated, "stored leveling reapplied");
        }

        metrics::histogram!("bidvet_analysis_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            documents = documents.len(),
            items = items.len(),
            buckets = analysis.bucket_count,
            "analysis finished"
        );
        Ok(())
    }

    async fn stored_leveling(&self, project_id: Uuid) -> Result<Option<LevelingConfig>, PipelineError> {
        Ok(self
            .store
            .comparison(project_id)
            .await?
            .and_then(|comparison| comparison.leveling))
    }

    /// Recompute assignments over the project's current items and store them
    /// together with `config` in one transaction.
    async fn reapply_leveling(
        &self,
        project_id: Uuid,
        config: &LevelingConfig,
    ) -> Result<u64, PipelineError> {
        let document_ids: Vec<Uuid> = self
            .store
            .documents(project_id)
            .await?
            .iter()
            .map(|document| document.id)
            .collect();
        let items = self.store.project_items(project_id).await?;
        let assignments = leveling::compute_assignments(config, &document_ids, &items);
        Ok(self
            .store
            .apply_leveling(project_id, Some(config), &assignments)
            .await?)
    }

    async fn seed_labels(&self, project: &Project) -> Result<Vec<String>, PipelineError> {
        let Some(template_id) = project.breakdown_template_id else {
            return Ok(Vec::new());
        };
        match self.store.breakdown_template(template_id).await? {
            Some(template) => Ok(breakdown::seed_labels(&template)),
            None => {
                warn!(%template_id, "selected breakdown template is gone; matching without seeds");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_leveling(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<Option<LevelingConfig>, PipelineError> {
        self.authorized_project(actor, project_id).await?;
        Ok(self
            .store
            .comparison(project_id)
            .await?
            .and_then(|comparison| comparison.leveling))
    }

    /// Store `config` and recompute every item's baseline flag and leveled
    /// price from scratch.
    #[instrument(skip(self, config), fields(baselines = config.baselines.len()))]
    pub async fn set_leveling(
        &self,
        actor: Uuid,
        project_id: Uuid,
        config: LevelingConfig,
    ) -> Result<LevelingOutcome, PipelineError> {
        let project = self.authorized_project(actor, project_id).await?;
        Self::ensure_idle(&project)?;
        let document_ids: Vec<Uuid> = self
            .store
            .documents(project_id)
            .await?
            .iter()
            .map(|document| document.id)
            .collect();
        leveling::validate(&config, &document_ids)?;

        let items = self.store.project_items(project_id).await?;
        let assignments = leveling::compute_assignments(&config, &document_ids, &items);
        let updated_item_count = match self
            .store
            .apply_leveling(project_id, Some(&config), &assignments)
            .await
        {
            Ok(count) => count,
            Err(StoreError::Missing(_)) => {
                return Err(PipelineError::conflict(
                    "project has no comparison yet; run analysis before leveling",
                ));
            }
            Err(err) => return Err(err.into()),
        };
        info!(updated_item_count, "leveling applied");
        Ok(LevelingOutcome { updated_item_count })
    }

    #[instrument(skip(self))]
    pub async fn clear_leveling(&self, actor: Uuid, project_id: Uuid) -> Result<(), PipelineError> {
        let project = self.authorized_project(actor, project_id).await?;
        Self::ensure_idle(&project)?;
        match self.store.apply_leveling(project_id, None, &[]).await {
            Ok(_) | Err(StoreError::Missing(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn edit_item(
        &self,
        actor: Uuid,
        item_id: Uuid,
        patch: &Map<String, Value>,
        reason: Option<&str>,
    ) -> Result<EditOutcome, PipelineError> {
        let (item, project) = self.authorized_item(actor, item_id).await?;
        Self::ensure_idle(&project)?;
        ledger::edit(self.store.as_ref(), &item, actor, patch, reason).await
    }

    pub async fn revert_item(
        &self,
        actor: Uuid,
        item_id: Uuid,
        target: &RevertTarget,
    ) -> Result<RevertOutcome, PipelineError> {
        let (item, project) = self.authorized_item(actor, item_id).await?;
        Self::ensure_idle(&project)?;
        ledger::revert(self.store.as_ref(), &item, actor, target).await
    }

    pub async fn item_history(
        &self,
        actor: Uuid,
        item_id: Uuid,
    ) -> Result<Vec<ItemEditHistory>, PipelineError> {
        self.authorized_item(actor, item_id).await?;
        Ok(self.store.item_history(item_id).await?)
    }

    /// Scheduled job entry point; not scoped to a caller.
    pub async fn calibrate(&self) -> Result<CalibrationReport, PipelineError> {
        calibration::calibrate(self.store.as_ref(), &self.config.calibration).await
    }

    pub async fn project_status(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectStatusView, PipelineError> {
        let project = self.authorized_project(actor, project_id).await?;
        let documents = self.store.documents(project_id).await?;
        Ok(ProjectStatusView {
            project_id,
            status: project.status,
            status_message: project.status_message,
            updated_at: project.updated_at,
            documents: documents
                .iter()
                .map(|document| DocumentStatusView {
                    document_id: document.id,
                    contractor_name: document.contractor_name.clone(),
                    status: document.status,
                    status_message: document.status_message.clone(),
                    has_text: document.has_text(),
                })
                .collect(),
        })
    }

    pub async fn comparison(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<ComparisonResult, PipelineError> {
        self.authorized_project(actor, project_id).await?;
        self.store
            .comparison(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("comparison for project {project_id}")))
    }

    /// Unmodified items that still need a look: mandatory first, then the
    /// least confident.
    pub async fn review_queue(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<ReviewQueueEntry>, PipelineError> {
        self.authorized_project(actor, project_id).await?;
        let documents = self.store.documents(project_id).await?;
        let items = self.store.project_items(project_id).await?;

        let mut queue: Vec<ReviewQueueEntry> = items
            .into_iter()
            .filter(|item| !item.user_modified && item.confidence_tier != ConfidenceTier::High)
            .map(|item| ReviewQueueEntry {
                review: item.confidence_tier.review(),
                contractor_name: documents
                    .iter()
                    .find(|document| document.id == item.document_id)
                    .map(|document| document.contractor_name.clone())
                    .unwrap_or_default(),
                item,
            })
            .collect();
        queue.sort_by(|a, b| {
            a.item
                .confidence_tier
                .cmp(&b.item.confidence_tier)
                .then(a.item.confidence.total_cmp(&b.item.confidence))
                .then(a.item.line_number.cmp(&b.item.line_number))
        });
        Ok(queue)
    }

    pub async fn breakdown_options(
        &self,
        trade_type: &str,
    ) -> Result<Vec<BreakdownOption>, PipelineError> {
        let templates = self.store.breakdown_templates(trade_type).await?;
        Ok(breakdown::options(&templates))
    }

    #[instrument(skip(self))]
    pub async fn select_breakdown(
        &self,
        actor: Uuid,
        project_id: Uuid,
        template_id: Uuid,
    ) -> Result<BreakdownSelection, PipelineError> {
        let project = self.authorized_project(actor, project_id).await?;
        Self::ensure_idle(&project)?;
        let template = self
            .store
            .breakdown_template(template_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("breakdown template {template_id}")))?;
        if trade_key(&template.trade_type) != trade_key(&project.trade_type) {
            return Err(PipelineError::validation(format!(
                "template is for {} but the project trade is {}",
                template.trade_type, project.trade_type
            )));
        }
        breakdown::validate(&template)?;
        self.store
            .select_breakdown_template(project_id, template_id)
            .await?;
        Ok(BreakdownSelection {
            template_id,
            seed_labels: breakdown::seed_labels(&template),
        })
    }
}
