//! Structured lifecycle events for evaluation runs.
//!
//! This module provides:
//! - a run-scoped span, attached to the run future with `Instrument`
//! - emission functions for run start, chunk commits, failures and finish
//!
//! Events are emitted at `info!` level (filter with `SURVEYSIFT_LOG`).
//! Failures that do not stop the run are emitted at `warn!`.

use tracing::{info, warn, Span};

/// Span tagged with the run id. Every event of the run nests under it.
///
/// ```ignore
/// orchestrator.run(candidates, None).instrument(obs::run_span(&run_id)).await
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("surveysift.run", run_id = %run_id)
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, total: usize, pending: usize, concurrency: usize, model: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        total = total,
        pending = pending,
        concurrency = concurrency,
        model = %model,
    );
}

/// Emit event: run resumed from a checkpoint.
pub fn emit_run_resumed(run_id: &str, next_index: usize, recorded: usize) {
    info!(
        event = "run.resumed",
        run_id = %run_id,
        next_index = next_index,
        recorded = recorded,
    );
}

/// Emit event: a chunk boundary was committed to the checkpoint store.
pub fn emit_chunk_committed(
    run_id: &str,
    next_index: usize,
    evaluated: usize,
    matched: usize,
    failed: usize,
    total_tokens: u64,
    estimated_cost: f64,
) {
    info!(
        event = "chunk.committed",
        run_id = %run_id,
        next_index = next_index,
        evaluated = evaluated,
        matched = matched,
        failed = failed,
        total_tokens = total_tokens,
        estimated_cost = estimated_cost,
    );
}

/// Emit event: one candidate ended in a failure marker.
pub fn emit_candidate_failed(run_id: &str, index: usize, candidate_id: &str, cause: &dyn std::fmt::Display) {
    warn!(
        event = "candidate.failed",
        run_id = %run_id,
        index = index,
        candidate_id = %candidate_id,
        cause = %cause,
    );
}

/// Emit event: a checkpoint could not be written; the run continues.
pub fn emit_checkpoint_write_failed(run_id: &str, next_index: usize, error: &dyn std::fmt::Display) {
    warn!(
        event = "checkpoint.write_failed",
        run_id = %run_id,
        next_index = next_index,
        error = %error,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    evaluated: usize,
    matched: usize,
    failed: usize,
    interrupted: bool,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        evaluated = evaluated,
        matched = matched,
        failed = failed,
        interrupted = interrupted,
    );
}
