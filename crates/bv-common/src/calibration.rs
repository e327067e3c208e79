//! Per-trade confidence threshold calibration from correction history.
//!
//! An item counts as corrected when the ledger holds at least one edit for
//! it. For each trade the calibrator looks for the loosest thresholds whose
//! tiers still keep the correction rate under target, and persists them
//! only when they moved by at least `min_delta`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::PipelineError;
use crate::model::{ConfidenceThreshold, CorrectionSample, trade_key};
use crate::store::BidStore;

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub min_samples: usize,
    /// Acceptable correction rate among `high` items.
    pub target_high_rate: f64,
    /// Acceptable correction rate among items that skip mandatory review.
    pub target_optional_rate: f64,
    pub min_tier_samples: usize,
    pub floor: f64,
    pub ceiling: f64,
    pub min_gap: f64,
    pub min_delta: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            target_high_rate: 0.10,
            target_optional_rate: 0.30,
            min_tier_samples: 5,
            floor: 0.30,
            ceiling: 0.95,
            min_gap: 0.10,
            min_delta: 0.02,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl CalibrationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_samples: env_or("BIDVET_CALIBRATION_MIN_SAMPLES", defaults.min_samples),
            target_high_rate: env_or(
                "BIDVET_CALIBRATION_TARGET_HIGH_RATE",
                defaults.target_high_rate,
            ),
            target_optional_rate: env_or(
                "BIDVET_CALIBRATION_TARGET_OPTIONAL_RATE",
                defaults.target_optional_rate,
            ),
            min_delta: env_or("BIDVET_CALIBRATION_MIN_DELTA", defaults.min_delta),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPair {
    pub low: f64,
    pub medium: f64,
}

impl From<&ConfidenceThreshold> for ThresholdPair {
    fn from(threshold: &ConfidenceThreshold) -> Self {
        Self {
            low: threshold.low,
            medium: threshold.medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationOutcome {
    Updated,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCalibration {
    pub trade_type: String,
    pub outcome: CalibrationOutcome,
    pub previous: ThresholdPair,
    pub proposed: Option<ThresholdPair>,
    pub sample_count: usize,
    pub correction_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub trades_updated: usize,
    pub trades_skipped: usize,
    pub trades_unchanged: usize,
    pub changes: Vec<TradeCalibration>,
}

/// Thresholds on a 0.05 grid, kept exact to two decimals.
fn grid(from: f64, to: f64) -> impl Iterator<Item = f64> {
    let start = (from * 100.0).round() as i64;
    let end = (to * 100.0).round() as i64;
    (start..=end).step_by(5).map(|cents| cents as f64 / 100.0)
}

/// `(count, corrected)` among samples with confidence at or above `threshold`.
fn at_or_above(samples: &[&CorrectionSample], threshold: f64) -> (usize, usize) {
    samples
        .iter()
        .filter(|sample| sample.confidence >= threshold)
        .fold((0, 0), |(count, corrected), sample| {
            (count + 1, corrected + usize::from(sample.corrected))
        })
}

fn smallest_passing(
    samples: &[&CorrectionSample],
    candidates: impl Iterator<Item = f64>,
    target_rate: f64,
    min_count: usize,
) -> Option<f64> {
    candidates.into_iter().find(|threshold| {
        let (count, corrected) = at_or_above(samples, *threshold);
        count >= min_count && corrected as f64 / count as f64 <= target_rate
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Proposed `(low, medium)` for one trade's samples.
pub fn propose(samples: &[&CorrectionSample], config: &CalibrationConfig) -> ThresholdPair {
    let medium = smallest_passing(
        samples,
        grid(0.50, config.ceiling),
        config.target_high_rate,
        config.min_tier_samples,
    )
    .unwrap_or(config.ceiling);

    let low_cap = round2(medium - config.min_gap).max(config.floor);
    let low = smallest_passing(
        samples,
        grid(config.floor, low_cap),
        config.target_optional_rate,
        config.min_tier_samples,
    )
    .unwrap_or(low_cap)
    .clamp(config.floor, low_cap);

    ThresholdPair { low, medium }
}

#[instrument(skip_all)]
pub async fn calibrate(
    store: &dyn BidStore,
    config: &CalibrationConfig,
) -> Result<CalibrationReport, PipelineError> {
    let samples = store.correction_samples().await?;
    let stored: BTreeMap<String, ConfidenceThreshold> = store
        .thresholds()
        .await?
        .into_iter()
        .map(|threshold| (trade_key(&threshold.trade_type), threshold))
        .collect();

    let mut by_trade: BTreeMap<String, Vec<&CorrectionSample>> = stored
        .keys()
        .map(|trade| (trade.clone(), Vec::new()))
        .collect();
    for sample in &samples {
        by_trade
            .entry(trade_key(&sample.trade_type))
            .or_default()
            .push(sample);
    }

    let mut report = CalibrationReport::default();
    for (trade_type, trade_samples) in by_trade {
        let current = stored
            .get(&trade_type)
            .cloned()
            .unwrap_or_else(|| ConfidenceThreshold::defaults(&trade_type));
        let previous = ThresholdPair::from(&current);
        let sample_count = trade_samples.len();
        let correction_rate = (sample_count > 0).then(|| {
            trade_samples.iter().filter(|sample| sample.corrected).count() as f64
                / sample_count as f64
        });

        if sample_count < config.min_samples {
            info!(%trade_type, sample_count, min_samples = config.min_samples, "calibration skipped");
            report.trades_skipped += 1;
            report.changes.push(TradeCalibration {
                trade_type,
                outcome: CalibrationOutcome::Skipped,
                previous,
                proposed: None,
                sample_count,
                correction_rate,
            });
            continue;
        }

        let proposed = propose(&trade_samples, config);
        let moved = (proposed.low - previous.low).abs() >= config.min_delta
            || (proposed.medium - previous.medium).abs() >= config.min_delta;
        let outcome = if moved {
            store
                .upsert_threshold(&ConfidenceThreshold {
                    trade_type: trade_type.clone(),
                    low: proposed.low,
                    medium: proposed.medium,
                    sample_count: sample_count as i64,
                    updated_at: Utc::now(),
                })
                .await?;
            report.trades_updated += 1;
            CalibrationOutcome::Updated
        } else {
            report.trades_unchanged += 1;
            CalibrationOutcome::Unchanged
        };
        info!(
            %trade_type,
            sample_count,
            outcome = ?outcome,
            low = proposed.low,
            medium = proposed.medium,
            "trade calibrated"
        );
        report.changes.push(TradeCalibration {
            trade_type,
            outcome,
            previous,
            proposed: Some(proposed),
            sample_count,
            correction_rate,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn samples(trade: &str, confidence: f64, total: usize, corrected: usize) -> Vec<CorrectionSample> {
        (0..total)
            .map(|index| CorrectionSample {
                trade_type: trade.into(),
                confidence,
                corrected: index < corrected,
            })
            .collect()
    }

    fn drywall() -> Vec<CorrectionSample> {
        let mut all = samples("drywall", 0.9, 20, 0);
        all.extend(samples("drywall", 0.6, 20, 10));
        all.extend(samples("drywall", 0.4, 20, 15));
        all
    }

    #[test]
    fn proposal_tightens_high_and_relaxes_low() {
        let all = drywall();
        let refs: Vec<&CorrectionSample> = all.iter().collect();
        let proposed = propose(&refs, &CalibrationConfig::default());
        assert_eq!(proposed, ThresholdPair { low: 0.45, medium: 0.65 });
    }

    #[test]
    fn uncorrectable_trade_falls_to_the_ceiling() {
        let all = samples("roofing", 0.99, 60, 30);
        let refs: Vec<&CorrectionSample> = all.iter().collect();
        let proposed = propose(&refs, &CalibrationConfig::default());
        assert_eq!(proposed.medium, 0.95);
        assert_eq!(proposed.low, 0.85);
    }

    #[tokio::test]
    async fn small_trades_are_skipped_regardless_of_rate() {
        let store = MemoryStore::new();
        store.insert_correction_samples(samples("glazing", 0.95, 3, 3)).await;
        let config = CalibrationConfig {
            min_samples: 5,
            ..CalibrationConfig::default()
        };

        let report = calibrate(&store, &config).await.unwrap();
        assert_eq!(report.trades_skipped, 1);
        assert_eq!(report.trades_updated, 0);
        assert_eq!(report.changes[0].outcome, CalibrationOutcome::Skipped);
        assert_eq!(report.changes[0].sample_count, 3);
        assert!(store.threshold("glazing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn material_moves_are_persisted_and_noise_is_not() {
        let store = MemoryStore::new();
        store.insert_correction_samples(drywall()).await;
        let config = CalibrationConfig {
            min_samples: 5,
            ..CalibrationConfig::default()
        };

        let first = calibrate(&store, &config).await.unwrap();
        assert_eq!(first.trades_updated, 1);
        assert_eq!(first.changes[0].previous, ThresholdPair { low: 0.50, medium: 0.80 });
        let stored = store.threshold("drywall").await.unwrap().unwrap();
        assert_eq!((stored.low, stored.medium), (0.45, 0.65));
        assert_eq!(stored.sample_count, 60);

        let second = calibrate(&store, &config).await.unwrap();
        assert_eq!(second.trades_unchanged, 1);
        assert_eq!(second.changes[0].outcome, CalibrationOutcome::Unchanged);
    }

    #[tokio::test]
    async fn trade_names_differing_in_case_share_one_threshold() {
        let store = MemoryStore::new();
        let mut all = samples("Drywall ", 0.9, 20, 0);
        all.extend(samples("drywall", 0.6, 20, 10));
        all.extend(samples("DRYWALL", 0.4, 20, 15));
        store.insert_correction_samples(all).await;
        let config = CalibrationConfig {
            min_samples: 5,
            ..CalibrationConfig::default()
        };

        let report = calibrate(&store, &config).await.unwrap();
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].trade_type, "drywall");
        assert_eq!(report.changes[0].sample_count, 60);

        let used = crate::items::thresholds_for(&store, "  Drywall").await.unwrap();
        assert_eq!((used.low, used.medium), (0.45, 0.65));
    }
}
