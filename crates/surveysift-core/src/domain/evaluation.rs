//! Evaluation outcomes and the deterministic scoring rule.
//!
//! A result slot is always an [`EvaluationOutcome`]: either a fully validated
//! [`EvaluationResult`] or a [`FailureMarker`] that keeps the collection dense
//! and index-aligned with the input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::candidate::CandidateRecord;
use super::usage::TokenUsage;

/// Minimum overall score (inclusive) for a survey to count as a target.
pub const TARGET_THRESHOLD: f64 = 7.0;

const TARGET_THRESHOLD_TENTHS: u32 = 70;

/// Weighted overall score in tenths: `4r + 3s + 3q`.
///
/// Integer arithmetic keeps `round(r*0.4 + s*0.3 + q*0.3, 1)` exact.
fn overall_tenths(relevance: u8, survey: u8, quality: u8) -> u32 {
    4 * u32::from(relevance) + 3 * u32::from(survey) + 3 * u32::from(quality)
}

/// `round(relevance*0.4 + survey*0.3 + quality*0.3, 1)`.
pub fn overall_score(relevance: u8, survey: u8, quality: u8) -> f64 {
    f64::from(overall_tenths(relevance, survey, quality)) / 10.0
}

/// The target rule: high enough overall AND actually a survey.
///
/// Intentionally conservative; a miss is preferred over a false positive.
pub fn decide_target(overall: f64, is_survey: bool) -> bool {
    is_survey && (overall * 10.0).round() >= f64::from(TARGET_THRESHOLD_TENTHS)
}

/// A successfully classified candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub candidate_id: String,
    pub title: String,
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub relevance_score: u8,
    pub survey_score: u8,
    pub quality_score: u8,
    pub overall_score: f64,
    pub is_survey: bool,
    pub is_target: bool,
    pub reasoning: String,
    pub survey_indicators: Vec<String>,
    pub key_topics: Vec<String>,
    /// Usage summed over every attempt spent on this candidate.
    pub token_usage: TokenUsage,
    pub attempts: u32,
    pub evaluated_at: DateTime<Utc>,
}

/// The validated content of a model reply, before it is bound to a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub relevance_score: u8,
    pub survey_score: u8,
    pub quality_score: u8,
    pub is_survey: bool,
    pub reasoning: String,
    pub survey_indicators: Vec<String>,
    pub key_topics: Vec<String>,
}

impl EvaluationResult {
    /// Bind a validated assessment to its candidate and apply the scoring rule.
    pub fn from_assessment(
        candidate: &CandidateRecord,
        assessment: Assessment,
        token_usage: TokenUsage,
        attempts: u32,
    ) -> Self {
        let overall = overall_score(
            assessment.relevance_score,
            assessment.survey_score,
            assessment.quality_score,
        );
        Self {
            candidate_id: candidate.id.clone(),
            title: candidate.title.clone(),
            categories: candidate.categories.clone(),
            published_at: candidate.published_at,
            relevance_score: assessment.relevance_score,
            survey_score: assessment.survey_score,
            quality_score: assessment.quality_score,
            overall_score: overall,
            is_survey: assessment.is_survey,
            is_target: decide_target(overall, assessment.is_survey),
            reasoning: assessment.reasoning,
            survey_indicators: assessment.survey_indicators,
            key_topics: assessment.key_topics,
            token_usage,
            attempts,
            evaluated_at: Utc::now(),
        }
    }
}

/// Why a candidate could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// Timeouts or rate limits persisted past the retry bound.
    TransientExhausted { attempts: u32, last_error: String },
    /// The reply did not satisfy the schema, even after the corrective retry.
    Parse { detail: String },
    /// The model declined to answer.
    ContentRefusal { detail: String },
    /// A non-transient API failure (bad request, malformed envelope).
    Rejected { detail: String },
    /// The evaluation task itself died.
    TaskFailed { detail: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "transient failure persisted after {attempts} attempt(s): {last_error}"
            ),
            Self::Parse { detail } => write!(f, "unparseable model reply: {detail}"),
            Self::ContentRefusal { detail } => write!(f, "model refused: {detail}"),
            Self::Rejected { detail } => write!(f, "request rejected: {detail}"),
            Self::TaskFailed { detail } => write!(f, "evaluation task failed: {detail}"),
        }
    }
}

/// Placeholder recorded for a candidate that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMarker {
    pub candidate_id: String,
    pub title: String,
    /// Always 0.
    pub overall_score: f64,
    /// Always false.
    pub is_target: bool,
    /// Human-readable failure cause.
    pub reasoning: String,
    pub cause: FailureCause,
    pub token_usage: TokenUsage,
    pub attempts: u32,
    pub evaluated_at: DateTime<Utc>,
}

impl FailureMarker {
    pub fn new(
        candidate: &CandidateRecord,
        cause: FailureCause,
        token_usage: TokenUsage,
        attempts: u32,
    ) -> Self {
        Self {
            candidate_id: candidate.id.clone(),
            title: candidate.title.clone(),
            overall_score: 0.0,
            is_target: false,
            reasoning: cause.to_string(),
            cause,
            token_usage,
            attempts,
            evaluated_at: Utc::now(),
        }
    }
}

/// One result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Success(EvaluationResult),
    Failure(FailureMarker),
}

impl EvaluationOutcome {
    pub fn candidate_id(&self) -> &str {
        match self {
            Self::Success(r) => &r.candidate_id,
            Self::Failure(m) => &m.candidate_id,
        }
    }

    pub fn overall_score(&self) -> f64 {
        match self {
            Self::Success(r) => r.overall_score,
            Self::Failure(m) => m.overall_score,
        }
    }

    pub fn is_target(&self) -> bool {
        match self {
            Self::Success(r) => r.is_target,
            Self::Failure(m) => m.is_target,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn token_usage(&self) -> &TokenUsage {
        match self {
            Self::Success(r) => &r.token_usage,
            Self::Failure(m) => &m.token_usage,
        }
    }

    pub fn as_success(&self) -> Option<&EvaluationResult> {
        match self {
            Self::Success(r) => Some(r),
            Self::Failure(_) => None,
        }
    }

    /// `(candidate_id, overall, is_target)`: the part of an outcome that
    /// must not depend on scheduling.
    pub fn decision(&self) -> (&str, f64, bool) {
        (self.candidate_id(), self.overall_score(), self.is_target())
    }
}
