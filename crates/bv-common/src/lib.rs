//! Core of the bid leveling service.
//!
//! Raw bid files go through [`text`] extraction, then [`items`] extraction
//! by the LLM, [`scope`] matching across contractors and a recommendation.
//! Users then correct items through the [`ledger`], level quantities with
//! [`leveling`], and [`calibration`] tunes per-trade confidence thresholds
//! from their corrections. [`pipeline::Pipeline`] ties it all together.

pub mod breakdown;
pub mod calibration;
pub mod db;
pub mod error;
pub mod items;
pub mod ledger;
pub mod leveling;
pub mod llm;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod run_id;
pub mod scope;
pub mod storage;
pub mod store;
pub mod text;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineConfig};
