//! Scheduled job: recompute per-trade confidence thresholds from the edit
//! history and print the report as JSON.

use std::process::ExitCode;

use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info};

use bv_common::calibration::{self, CalibrationConfig, CalibrationReport};
use bv_common::db::{PgBidStore, create_pool_from_url, run_migrations};
use bv_common::logging;
use bv_common::store::BidStore;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "bv-calibrator",
    about = "Recalculate per-trade confidence thresholds from correction history"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Minimum samples before a trade is calibrated
    #[arg(long)]
    min_samples: Option<usize>,

    /// Smallest threshold move worth persisting
    #[arg(long)]
    min_delta: Option<f64>,

    /// Skip running migrations before calibrating
    #[arg(long, default_value_t = false)]
    skip_migrations: bool,
}

impl Cli {
    /// Flags override the environment, which overrides the defaults.
    fn calibration_config(&self) -> CalibrationConfig {
        let mut config = CalibrationConfig::from_env();
        if let Some(min_samples) = self.min_samples {
            config.min_samples = min_samples;
        }
        if let Some(min_delta) = self.min_delta.filter(|delta| delta.is_finite() && *delta >= 0.0) {
            config.min_delta = min_delta;
        }
        config
    }
}

async fn calibrate_and_report(
    store: &dyn BidStore,
    config: &CalibrationConfig,
) -> Result<CalibrationReport, String> {
    let report = calibration::calibrate(store, config)
        .await
        .map_err(|err| format!("calibration failed: {err}"))?;
    info!(
        updated = report.trades_updated,
        unchanged = report.trades_unchanged,
        skipped = report.trades_skipped,
        "calibration finished"
    );
    Ok(report)
}

async fn run(cli: Cli) -> Result<CalibrationReport, String> {
    let config = cli.calibration_config();
    let pool = create_pool_from_url(&cli.database_url).map_err(|err| err.to_string())?;
    if !cli.skip_migrations {
        run_migrations(&pool).await.map_err(|err| err.to_string())?;
    }
    let store = PgBidStore::new(pool);
    calibrate_and_report(&store, &config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    logging::init(env!("CARGO_PKG_NAME"));
    bv_metrics::init_metrics("BIDVET_CALIBRATOR_METRICS_PORT", 0);

    let cli = Cli::parse();
    match run(cli).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "failed to serialize calibration report");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            error!(error = %err, "bv-calibrator failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bv_common::calibration::CalibrationOutcome;
    use bv_common::model::CorrectionSample;
    use bv_common::store::MemoryStore;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["bv-calibrator", "--database-url", "postgres://localhost/bidvet"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn flags_override_defaults() {
        let config = cli(&["--min-samples", "5", "--min-delta", "0.05"]).calibration_config();
        assert_eq!(config.min_samples, 5);
        assert_eq!(config.min_delta, 0.05);

        let untouched = cli(&["--min-delta=-1"]).calibration_config();
        assert_eq!(untouched.min_delta, CalibrationConfig::from_env().min_delta);
    }

    #[tokio::test]
    async fn sparse_trades_are_reported_as_skipped() {
        let store = MemoryStore::new();
        store
            .insert_correction_samples(
                (0..3)
                    .map(|index| CorrectionSample {
                        trade_type: "glazing".into(),
                        confidence: 0.9,
                        corrected: index == 0,
                    })
                    .collect(),
            )
            .await;
        let config = cli(&["--min-samples", "5"]).calibration_config();

        let report = calibrate_and_report(&store, &config).await.unwrap();
        assert_eq!(report.trades_skipped, 1);
        assert_eq!(report.changes[0].outcome, CalibrationOutcome::Skipped);
        assert!(serde_json::to_string(&report).unwrap().contains("\"skipped\""));
    }
}
