//! Domain models for surveysift.
//!
//! Canonical definitions for the core entities:
//! - `CandidateRecord`: one input paper subject to classification
//! - `EvaluationResult` / `FailureMarker`: the two shapes a result slot can take
//! - `TokenUsage`: usage reported by one model call attempt

pub mod candidate;
pub mod error;
pub mod evaluation;
pub mod usage;

// Re-export main types and errors
pub use candidate::{CandidateFingerprint, CandidateRecord};
pub use error::{Result, SiftError};
pub use evaluation::{
    decide_target, overall_score, Assessment, EvaluationOutcome, EvaluationResult, FailureCause,
    FailureMarker, TARGET_THRESHOLD,
};
pub use usage::TokenUsage;
