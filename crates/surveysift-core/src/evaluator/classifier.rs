//! Per-candidate evaluation: prompt, call through the gate, parse, retry.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::parse::{parse_assessment, ParseError};
use super::prompt::PromptBuilder;
use crate::config::{EngineConfig, RetryPolicy};
use crate::domain::{
    CandidateRecord, EvaluationOutcome, EvaluationResult, FailureCause, FailureMarker, SiftError,
    TokenUsage,
};
use crate::gate::ConcurrencyGate;
use crate::metrics::METRICS;
use crate::model::{ModelClient, ModelError, ModelReply, ModelRequest};

/// Outcome for one candidate plus the usage of every attempt that reached
/// the model, tagged with its attempt number.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: EvaluationOutcome,
    pub usages: Vec<(u32, TokenUsage)>,
}

/// Why an evaluation produced no outcome.
#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    /// The gate closed before the next call could start.
    #[error("evaluation cancelled")]
    Cancelled { usages: Vec<(u32, TokenUsage)> },

    /// The whole run must stop.
    #[error(transparent)]
    Fatal(SiftError),
}

/// Classifies one candidate at a time. Cheap to clone; clones share the client.
#[derive(Clone)]
pub struct Evaluator {
    model: Arc<dyn ModelClient>,
    prompts: PromptBuilder,
    model_id: String,
    temperature: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("model_id", &self.model_id)
            .field("temperature", &self.temperature)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    pub fn new(model: Arc<dyn ModelClient>, config: &EngineConfig) -> Self {
        Self {
            model,
            prompts: PromptBuilder::new(config.criteria.clone()),
            model_id: config.model.clone(),
            temperature: config.temperature,
            retry: config.retry.clone(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Evaluate one candidate, holding a gate slot for each model call.
    ///
    /// Per-candidate failures come back as a [`FailureMarker`] outcome. Only
    /// gate closure and rejected credentials produce an error.
    #[instrument(skip(self, candidate, gate), fields(candidate = %candidate.id))]
    pub async fn evaluate(
        &self,
        candidate: &CandidateRecord,
        gate: &ConcurrencyGate,
    ) -> Result<Evaluation, EvaluateError> {
        let mut usages: Vec<(u32, TokenUsage)> = Vec::new();
        let mut prompt = self.prompts.evaluation_prompt(candidate);
        let mut attempt = 0u32;
        let mut transient_failures = 0u32;
        let mut corrected = false;

        loop {
            attempt += 1;
            let request = ModelRequest {
                prompt: prompt.clone(),
                model: self.model_id.clone(),
                temperature: self.temperature,
                correlation_id: candidate.id.clone(),
            };
            let reply = match gate.run(|| self.call(request)).await {
                Ok(reply) => reply,
                Err(_closed) => return Err(EvaluateError::Cancelled { usages }),
            };

            let failure = match reply {
                Ok(reply) => {
                    usages.push((attempt, reply.usage));
                    match parse_assessment(&reply.text) {
                        Ok(assessment) => {
                            let usage = self.total_usage(&usages);
                            let result = EvaluationResult::from_assessment(
                                candidate, assessment, usage, attempt,
                            );
                            debug!(
                                overall = result.overall_score,
                                is_target = result.is_target,
                                attempts = attempt,
                                "candidate evaluated"
                            );
                            return Ok(Evaluation {
                                outcome: EvaluationOutcome::Success(result),
                                usages,
                            });
                        }
                        Err(err) if !corrected => {
                            warn!(error = %err, "unusable reply, sending corrective prompt");
                            METRICS.inc_retries();
                            corrected = true;
                            prompt = self.prompts.corrective_prompt(candidate, &err);
                            continue;
                        }
                        Err(err) => parse_failure(err),
                    }
                }
                Err(err) if err.is_fatal() => {
                    return Err(EvaluateError::Fatal(SiftError::ModelUnauthorized(
                        err.to_string(),
                    )));
                }
                Err(err) if err.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= self.retry.max_attempts {
                        FailureCause::TransientExhausted {
                            attempts: transient_failures,
                            last_error: err.to_string(),
                        }
                    } else {
                        let wait = self
                            .retry
                            .backoff(transient_failures)
                            .max(err.retry_after().unwrap_or_default());
                        warn!(
                            error = %err,
                            attempt = transient_failures,
                            wait_ms = wait.as_millis() as u64,
                            "transient model failure, backing off"
                        );
                        METRICS.inc_retries();
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                }
                Err(ModelError::Refused { detail, usage }) => {
                    if let Some(usage) = usage {
                        usages.push((attempt, usage));
                    }
                    FailureCause::ContentRefusal { detail }
                }
                Err(other) => FailureCause::Rejected {
                    detail: other.to_string(),
                },
            };

            let usage = self.total_usage(&usages);
            let marker = FailureMarker::new(candidate, failure, usage, attempt);
            return Ok(Evaluation {
                outcome: EvaluationOutcome::Failure(marker),
                usages,
            });
        }
    }

    async fn call(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        METRICS.inc_model_calls();
        self.model.complete(request).await
    }

    fn total_usage(&self, usages: &[(u32, TokenUsage)]) -> TokenUsage {
        TokenUsage::sum(&self.model_id, usages.iter().map(|(_, u)| u))
    }
}

fn parse_failure(err: ParseError) -> FailureCause {
    FailureCause::Parse {
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fakes::{candidates, reply_json, FakeModel, FAKE_PROMPT_TOKENS};

    fn evaluator(model: Arc<FakeModel>, max_attempts: u32) -> Evaluator {
        let config = EngineConfig::default().with_retry(RetryPolicy {
            max_attempts,
            backoff_base_ms: 500,
            max_backoff_ms: 30_000,
        });
        Evaluator::new(model, &config)
    }

    fn gate() -> ConcurrencyGate {
        ConcurrencyGate::new(1, Duration::ZERO)
    }

    fn failure_cause(evaluation: &Evaluation) -> &FailureCause {
        match &evaluation.outcome {
            EvaluationOutcome::Failure(m) => &m.cause,
            EvaluationOutcome::Success(r) => panic!("expected failure, got {r:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_applies_scoring_rule() {
        let model = Arc::new(FakeModel::always(reply_json(9, 9, 8, true)));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();

        let result = ev.outcome.as_success().unwrap();
        assert_eq!(result.overall_score, 8.7);
        assert!(result.is_target);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.candidate_id, c.id);
        assert_eq!(ev.usages.len(), 1);
        assert_eq!(model.calls_for(&c.id), 1);
    }

    #[tokio::test]
    async fn test_parse_error_gets_exactly_one_corrective_retry() {
        let model = Arc::new(FakeModel::new(|_, n, prompt| {
            if n == 1 {
                Ok("{\"relevance_score\": 9}".to_string())
            } else {
                assert!(prompt.contains("previous reply could not be used"));
                Ok(reply_json(8, 8, 8, true))
            }
        }));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();
        let result = ev.outcome.as_success().unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.token_usage.prompt_tokens, 2 * FAKE_PROMPT_TOKENS);
        assert_eq!(ev.usages.iter().map(|(a, _)| *a).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(model.calls_for(&c.id), 2);
    }

    #[tokio::test]
    async fn test_second_parse_error_is_failure_marker() {
        let model = Arc::new(FakeModel::always(
            r#"{"relevance_score": 9, "survey_score": 9, "quality_score": 9, "is_survey": null,
                "reasoning": "", "survey_indicators": [], "key_topics": []}"#
                .to_string(),
        ));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();
        assert!(matches!(failure_cause(&ev), FailureCause::Parse { .. }));
        assert!(!ev.outcome.is_target());
        assert_eq!(ev.outcome.overall_score(), 0.0);
        assert_eq!(ev.usages.len(), 2);
        assert_eq!(model.calls_for(&c.id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_with_backoff() {
        let model = Arc::new(FakeModel::new(|_, n, _| {
            if n < 3 {
                Err(ModelError::Server { status: 503 })
            } else {
                Ok(reply_json(7, 7, 7, true))
            }
        }));
        let c = &candidates(1)[0];
        let start = tokio::time::Instant::now();
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();

        // 500ms after the first failure, 1000ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(1_500));
        let result = ev.outcome.as_success().unwrap();
        assert!(result.is_target);
        assert_eq!(result.attempts, 3);
        assert_eq!(ev.usages.len(), 1);
        assert_eq!(ev.usages[0].0, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_is_failure_marker() {
        let model = Arc::new(FakeModel::new(|_, _, _| Err(ModelError::Timeout)));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();
        assert_eq!(
            failure_cause(&ev),
            &FailureCause::TransientExhausted {
                attempts: 3,
                last_error: ModelError::Timeout.to_string()
            }
        );
        assert_eq!(model.calls_for(&c.id), 3);
        assert!(ev.usages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_lengthens_wait() {
        let model = Arc::new(FakeModel::new(|_, n, _| {
            if n == 1 {
                Err(ModelError::RateLimited {
                    retry_after: Some(Duration::from_secs(5)),
                })
            } else {
                Ok(reply_json(5, 5, 5, false))
            }
        }));
        let c = &candidates(1)[0];
        let start = tokio::time::Instant::now();
        let ev = evaluator(model, 3).evaluate(c, &gate()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(ev.outcome.as_success().is_some());
    }

    #[tokio::test]
    async fn test_refusal_is_not_retried() {
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(ModelError::refused("content_filter"))
        }));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();
        assert!(matches!(failure_cause(&ev), FailureCause::ContentRefusal { .. }));
        assert_eq!(model.calls_for(&c.id), 1);
    }

    #[tokio::test]
    async fn test_refusal_usage_is_accounted() {
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(ModelError::Refused {
                detail: "I can't help with that".into(),
                usage: Some(TokenUsage::new("gpt-4", 750, 12)),
            })
        }));
        let c = &candidates(1)[0];
        let ev = evaluator(model, 3).evaluate(c, &gate()).await.unwrap();
        assert!(matches!(failure_cause(&ev), FailureCause::ContentRefusal { .. }));
        assert_eq!(ev.usages, vec![(1, TokenUsage::new("gpt-4", 750, 12))]);
        assert_eq!(ev.outcome.token_usage().total_tokens, 762);
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_retried() {
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(ModelError::Rejected {
                status: 400,
                detail: "context length exceeded".into(),
            })
        }));
        let c = &candidates(1)[0];
        let ev = evaluator(model.clone(), 3).evaluate(c, &gate()).await.unwrap();
        assert!(matches!(failure_cause(&ev), FailureCause::Rejected { .. }));
        assert_eq!(model.calls_for(&c.id), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(ModelError::Unauthorized { status: 401 })
        }));
        let c = &candidates(1)[0];
        let err = evaluator(model, 3).evaluate(c, &gate()).await.unwrap_err();
        assert!(matches!(
            err,
            EvaluateError::Fatal(SiftError::ModelUnauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_gate_cancels_without_calling() {
        let model = Arc::new(FakeModel::always(reply_json(9, 9, 9, true)));
        let c = &candidates(1)[0];
        let gate = gate();
        gate.close();
        let err = evaluator(model.clone(), 3).evaluate(c, &gate).await.unwrap_err();
        assert!(matches!(err, EvaluateError::Cancelled { ref usages } if usages.is_empty()));
        assert_eq!(model.total_calls(), 0);
    }
}
