//! Typed records for everything the leveling pipeline persists.
//!
//! Every entity carries its foreign keys explicitly; joins are done by the
//! store, never assumed from nested query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Confidence bounds used when a trade has not been calibrated yet.
pub const DEFAULT_LOW_THRESHOLD: f64 = 0.50;
pub const DEFAULT_MEDIUM_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Processing => "processing",
            ProjectStatus::Complete => "complete",
            ProjectStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProjectStatus::Pending),
            "processing" => Some(ProjectStatus::Processing),
            "complete" => Some(ProjectStatus::Complete),
            "error" => Some(ProjectStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub trade_type: String,
    pub status: ProjectStatus,
    pub status_message: Option<String>,
    pub breakdown_template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(user_id: Uuid, name: &str, trade_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            organization_id: None,
            name: name.to_string(),
            trade_type: trade_type.to_string(),
            status: ProjectStatus::Pending,
            status_message: None,
            breakdown_template_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(DocumentStatus::Uploaded),
            "processed" => Some(DocumentStatus::Processed),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }
}

/// Page-level character span of the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpan {
    pub page: u32,
    pub char_start: usize,
    pub char_end: usize,
    pub width: f32,
    pub height: f32,
}

/// A positioned run of text (one `BT … ET` section of a PDF page).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub page: u32,
    pub index: u32,
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub font_size: Option<f32>,
}

/// Position data kept for PDFs so the UI can highlight the source of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionMap {
    pub pages: Vec<PageSpan>,
    pub blocks: Vec<TextBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidDocument {
    pub id: Uuid,
    pub project_id: Uuid,
    pub contractor_name: String,
    pub file_ref: String,
    pub file_type: String,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub raw_text: Option<String>,
    pub position_map: Option<PositionMap>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BidDocument {
    pub fn new(project_id: Uuid, contractor_name: &str, file_ref: &str, file_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            contractor_name: contractor_name.to_string(),
            file_ref: file_ref.to_string(),
            file_type: file_type.to_string(),
            status: DocumentStatus::Uploaded,
            status_message: None,
            raw_text: None,
            position_map: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_text(&self) -> bool {
        self.raw_text
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn contractor(&self) -> ContractorRef {
        ContractorRef {
            document_id: self.id,
            contractor_name: self.contractor_name.clone(),
        }
    }
}

/// Reliability bucket of an extraction. `Low` items must be reviewed,
/// `Medium` items may be reviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Low => "low",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(ConfidenceTier::Low),
            "medium" => Some(ConfidenceTier::Medium),
            "high" => Some(ConfidenceTier::High),
            _ => None,
        }
    }

    pub fn review(&self) -> ReviewRequirement {
        match self {
            ConfidenceTier::Low => ReviewRequirement::Mandatory,
            ConfidenceTier::Medium => ReviewRequirement::Optional,
            ConfidenceTier::High => ReviewRequirement::NotRequired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewRequirement {
    Mandatory,
    Optional,
    #[serde(rename = "none")]
    NotRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub id: Uuid,
    pub document_id: Uuid,
    pub line_number: i32,
    pub description: String,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
    pub is_exclusion: bool,
    pub is_inclusion: bool,
    pub confidence: f64,
    pub confidence_tier: ConfidenceTier,
    pub user_modified: bool,
    pub is_baseline: bool,
    pub leveled_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractedItem {
    pub fn new(document_id: Uuid, line_number: i32, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            line_number,
            description: description.to_string(),
            category: None,
            quantity: None,
            unit: None,
            unit_price: None,
            total_price: None,
            is_exclusion: false,
            is_inclusion: false,
            confidence: 0.0,
            confidence_tier: ConfidenceTier::Low,
            user_modified: false,
            is_baseline: false,
            leveled_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stated total, or quantity × unit price when the total is missing.
    pub fn effective_price(&self) -> Option<f64> {
        self.total_price.or(match (self.quantity, self.unit_price) {
            (Some(quantity), Some(unit_price)) => Some(quantity * unit_price),
            _ => None,
        })
    }
}

/// One field change on an item. `batch_id` groups the rows written by a
/// single edit or revert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEditHistory {
    pub id: Uuid,
    pub seq: i64,
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub field_name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub change_reason: Option<String>,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractorRef {
    pub document_id: Uuid,
    pub contractor_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorRollup {
    pub document_id: Uuid,
    pub contractor_name: String,
    pub item_count: usize,
    pub exclusion_count: usize,
    pub exclusions_value: f64,
    pub average_confidence: Option<f64>,
    pub base_bid: f64,
    pub gap_adjustment: f64,
    pub total_bid: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub trade_type: String,
    pub contractors: Vec<ContractorRollup>,
    pub bucket_count: usize,
    pub gap_count: usize,
}

/// A scope bucket that at least one analyzed contractor is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeGap {
    pub label: String,
    pub present_in: Vec<ContractorRef>,
    pub missing_from: Vec<ContractorRef>,
    pub estimated_value: Option<f64>,
    pub item_ids: Vec<Uuid>,
    pub excluded_by_present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub contractor_name: String,
    pub document_id: Option<Uuid>,
    pub confidence_tier: ConfidenceTier,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub description: String,
    pub quantity: f64,
    pub reference_document_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelingConfig {
    pub baselines: Vec<Baseline>,
}

/// Per-item outcome of applying a leveling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelingAssignment {
    pub item_id: Uuid,
    pub is_baseline: bool,
    pub leveled_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub project_id: Uuid,
    pub summary: ComparisonSummary,
    pub recommendation: Option<Recommendation>,
    pub price_low: Option<f64>,
    pub price_high: Option<f64>,
    pub price_average: Option<f64>,
    pub leveling: Option<LevelingConfig>,
    pub scope_gaps: Vec<ScopeGap>,
    pub analysis_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeNode {
    pub name: String,
    #[serde(default)]
    pub children: Vec<ScopeNode>,
}

impl ScopeNode {
    pub fn leaf(name: &str) -> Self {
        Self {
            name: name.to_string(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownTemplate {
    pub id: Uuid,
    pub trade_type: String,
    pub name: String,
    pub nodes: Vec<ScopeNode>,
    pub use_count: i64,
}

/// Listing view of a template offered for a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownOption {
    pub template_id: Uuid,
    pub name: String,
    pub leaf_count: usize,
    pub use_count: i64,
}

/// Canonical form of a trade name for threshold, sample and template lookups.
pub fn trade_key(trade_type: &str) -> String {
    trade_type.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThreshold {
    pub trade_type: String,
    pub low: f64,
    pub medium: f64,
    pub sample_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl ConfidenceThreshold {
    pub fn defaults(trade_type: &str) -> Self {
        Self {
            trade_type: trade_type.to_string(),
            low: DEFAULT_LOW_THRESHOLD,
            medium: DEFAULT_MEDIUM_THRESHOLD,
            sample_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn tier_for(&self, confidence: f64) -> ConfidenceTier {
        if confidence < self.low {
            ConfidenceTier::Low
        } else if confidence < self.medium {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::High
        }
    }
}

/// One extraction outcome as seen by the calibrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSample {
    pub trade_type: String,
    pub confidence: f64,
    pub corrected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_price_prefers_stated_total() {
        let mut item = ExtractedItem::new(Uuid::new_v4(), 1, "Demo existing flooring");
        item.quantity = Some(500.0);
        item.unit_price = Some(2.0);
        assert_eq!(item.effective_price(), Some(1000.0));

        item.total_price = Some(1100.0);
        assert_eq!(item.effective_price(), Some(1100.0));

        item.total_price = None;
        item.unit_price = None;
        assert_eq!(item.effective_price(), None);
    }

    #[test]
    fn thresholds_bucket_confidence_into_tiers() {
        let threshold = ConfidenceThreshold::defaults("flooring");
        assert_eq!(threshold.tier_for(0.2), ConfidenceTier::Low);
        assert_eq!(threshold.tier_for(0.5), ConfidenceTier::Medium);
        assert_eq!(threshold.tier_for(0.79), ConfidenceTier::Medium);
        assert_eq!(threshold.tier_for(0.8), ConfidenceTier::High);
        assert_eq!(
            threshold.tier_for(0.1).review(),
            ReviewRequirement::Mandatory
        );
    }

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in [
            ProjectStatus::Pending,
            ProjectStatus::Processing,
            ProjectStatus::Complete,
            ProjectStatus::Error,
        ] {
            assert_eq!(ProjectStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("skipped"), None);
        assert_eq!(ConfidenceTier::parse(" High "), Some(ConfidenceTier::High));
    }

    #[test]
    fn has_text_ignores_whitespace_only_text() {
        let mut doc = BidDocument::new(Uuid::new_v4(), "Acme", "files/a.pdf", "pdf");
        assert!(!doc.has_text());
        doc.raw_text = Some("  \n".into());
        assert!(!doc.has_text());
        doc.raw_text = Some("Line 1".into());
        assert!(doc.has_text());
    }
}
