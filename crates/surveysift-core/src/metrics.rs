//! Global atomic counters for surveysift runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does this at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    candidates_evaluated: AtomicU64,
    candidates_failed: AtomicU64,
    model_calls: AtomicU64,
    retries: AtomicU64,
    checkpoints_written: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            candidates_evaluated: AtomicU64::new(0),
            candidates_failed: AtomicU64::new(0),
            model_calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
        }
    }

    /// One candidate slot filled, success or failure.
    pub fn inc_candidates_evaluated(&self) {
        self.candidates_evaluated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_evaluated", "counter incremented");
    }

    pub fn inc_candidates_failed(&self) {
        self.candidates_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_failed", "counter incremented");
    }

    /// One request sent to the model API.
    pub fn inc_model_calls(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_calls", "counter incremented");
    }

    /// One retry scheduled (transient or corrective).
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_checkpoints_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "checkpoints_written", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            candidates_evaluated = self.candidates_evaluated(),
            candidates_failed = self.candidates_failed(),
            model_calls = self.model_calls(),
            retries = self.retries(),
            checkpoints_written = self.checkpoints_written(),
        );
    }

    pub fn candidates_evaluated(&self) -> u64 {
        self.candidates_evaluated.load(Ordering::Relaxed)
    }

    pub fn candidates_failed(&self) -> u64 {
        self.candidates_failed.load(Ordering::Relaxed)
    }

    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.candidates_evaluated.store(0, Ordering::Relaxed);
        self.candidates_failed.store(0, Ordering::Relaxed);
        self.model_calls.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.checkpoints_written.store(0, Ordering::Relaxed);
    }
}
