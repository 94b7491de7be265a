//! surveysift core library
//!
//! Screens a batch of paper records with a language model and keeps the
//! survey papers of a target domain. The pieces:
//!
//! - [`orchestrator`] drives a run: bounded concurrency, ordered results,
//!   chunked checkpoints, resume
//! - [`evaluator`] classifies one candidate: prompt, strict parse, retries
//! - [`gate`] caps in-flight model calls and paces them
//! - [`checkpoint`] persists progress atomically
//! - [`accounting`] tracks tokens and estimates cost
//! - [`reporting`] writes the result documents

pub mod accounting;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod evaluator;
pub mod fakes;
pub mod gate;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod reporting;
pub mod telemetry;

pub use accounting::{ModelPrice, PriceTable, TokenAccountant, TokenSummary};
pub use checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_SCHEMA_VERSION};
pub use config::{EngineConfig, ExecutionMode, ModelEndpoint, RetryPolicy, SiftConfig};
pub use domain::{
    decide_target, overall_score, CandidateRecord, EvaluationOutcome, EvaluationResult,
    FailureCause, FailureMarker, Result, SiftError, TokenUsage,
};
pub use evaluator::{Criteria, Evaluator};
pub use gate::ConcurrencyGate;
pub use model::{ModelClient, OpenAiClient};
pub use orchestrator::{select_window, Orchestrator, ProgressReport, RunReport, RunStatus};
pub use reporting::{OutputPaths, ResultDocument};

/// Crate version, as recorded in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
