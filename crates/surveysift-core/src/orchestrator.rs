//! Batch evaluation driver.
//!
//! The orchestrator owns the result slots, the accountant and the checkpoint
//! cadence. Evaluation tasks only hand back `(index, Evaluation)` through
//! their join handles; no state is shared behind a lock.
//!
//! Scheduling: every pending index is dispatched in input order with a
//! bounded look-ahead of `C + B` spawned tasks, and the [`ConcurrencyGate`]
//! caps in-flight model calls at `C`. Completions arrive in any order and are
//! written into their pre-assigned slot. The watermark is the length of the
//! contiguous filled prefix; whenever it crosses a multiple of `B` (or
//! reaches `N`) a checkpoint is committed with `next_index` at that boundary.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError};
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

use crate::accounting::{TokenAccountant, TokenSummary};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{EngineConfig, ExecutionMode};
use crate::domain::{
    CandidateRecord, EvaluationOutcome, EvaluationResult, FailureCause, FailureMarker, Result,
    TokenUsage,
};
use crate::evaluator::{EvaluateError, Evaluation, Evaluator};
use crate::gate::ConcurrencyGate;
use crate::metrics::METRICS;
use crate::obs;

/// Emitted after every committed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub run_id: String,
    /// Filled slots, this run and any resumed ones.
    pub evaluated: usize,
    pub matched: usize,
    pub failed: usize,
    pub next_index: usize,
    pub total: usize,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Stopped by a shutdown signal. Resume from `next_index`.
    Interrupted { next_index: usize },
}

/// Counters describing one call to [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub resumed_from: Option<usize>,
    /// Outcomes produced by this invocation (excludes resumed slots).
    pub evaluated_this_run: usize,
    pub matched: usize,
    pub failed: usize,
    pub checkpoints_written: usize,
    pub checkpoint_write_failures: usize,
    pub peak_in_flight: usize,
    pub duration_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub model: String,
    pub status: RunStatus,
    /// Index-aligned with the input. All `Some` when `status` is `Completed`.
    pub slots: Vec<Option<EvaluationOutcome>>,
    pub usage: TokenSummary,
    pub stats: RunStats,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Filled slots in input order.
    pub fn outcomes(&self) -> impl Iterator<Item = &EvaluationOutcome> {
        self.slots.iter().flatten()
    }

    /// Target papers in input order.
    pub fn matched(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.outcomes()
            .filter_map(EvaluationOutcome::as_success)
            .filter(|r| r.is_target)
    }
}

/// Slice of the input selected by `start_index` and `max_candidates`.
pub fn select_window<T>(items: &[T], start_index: usize, max_candidates: Option<usize>) -> &[T] {
    let start = start_index.min(items.len());
    let end = match max_candidates {
        Some(max) => start.saturating_add(max).min(items.len()),
        None => items.len(),
    };
    &items[start..end]
}

/// Drives a batch of candidates through an [`Evaluator`].
#[derive(Debug)]
pub struct Orchestrator {
    config: EngineConfig,
    evaluator: Evaluator,
    store: Option<CheckpointStore>,
    progress: Option<mpsc::UnboundedSender<ProgressReport>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Orchestrator {
    /// Fails if `config` does not validate.
    pub fn new(config: EngineConfig, evaluator: Evaluator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            evaluator,
            store: None,
            progress: None,
            shutdown: None,
        })
    }

    /// Persist progress at every chunk boundary.
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Receive a [`ProgressReport`] after every committed chunk.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressReport>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Stop gracefully once the watched value becomes `true`.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate `candidates`, optionally continuing from `resume`.
    ///
    /// A supplied checkpoint is verified against the input before anything
    /// else happens; recorded slots are never evaluated again.
    pub async fn run(
        &self,
        candidates: Arc<[CandidateRecord]>,
        resume: Option<Checkpoint>,
    ) -> Result<RunReport> {
        let prices = self.config.price_table();
        let n = candidates.len();

        let (run_id, slots, accountant, resumed_from) = match resume {
            Some(checkpoint) => {
                checkpoint.verify_against(&candidates)?;
                obs::emit_run_resumed(
                    &checkpoint.run_id,
                    checkpoint.next_index,
                    checkpoint.recorded(),
                );
                let next_index = checkpoint.next_index;
                (
                    checkpoint.run_id,
                    checkpoint.results,
                    TokenAccountant::restore(prices, checkpoint.usage),
                    Some(next_index),
                )
            }
            None => (
                Uuid::new_v4().to_string(),
                vec![None; n],
                TokenAccountant::new(prices),
                None,
            ),
        };

        let span = obs::run_span(&run_id);
        let state = RunState::new(
            run_id,
            Arc::clone(&candidates),
            slots,
            accountant,
            resumed_from,
            self,
        );
        self.drive(state).instrument(span).await
    }

    async fn drive(&self, mut state: RunState<'_>) -> Result<RunReport> {
        let started = Instant::now();
        let gate = Arc::new(ConcurrencyGate::new(
            self.config.effective_concurrency(),
            self.config.call_delay(),
        ));
        let pending: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect();

        obs::emit_run_started(
            &state.run_id,
            state.total(),
            pending.len(),
            gate.capacity(),
            &self.config.model,
        );

        let interrupted = match self.config.mode {
            ExecutionMode::Concurrent => self.dispatch_concurrent(&mut state, &gate, pending).await?,
            ExecutionMode::Sequential => self.dispatch_sequential(&mut state, &gate, pending).await?,
        };

        let status = if state.watermark < state.total() {
            RunStatus::Interrupted {
                next_index: state.watermark,
            }
        } else {
            RunStatus::Completed
        };
        state.commit_final();

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_run_finished(
            &state.run_id,
            duration_ms,
            state.filled,
            state.matched,
            state.failed,
            interrupted,
        );
        METRICS.flush();

        let usage = state.accountant.summary(state.filled);
        Ok(RunReport {
            stats: RunStats {
                total: state.total(),
                resumed_from: state.resumed_from,
                evaluated_this_run: state.evaluated_this_run,
                matched: state.matched,
                failed: state.failed,
                checkpoints_written: state.checkpoints_written,
                checkpoint_write_failures: state.checkpoint_write_failures,
                peak_in_flight: gate.peak(),
                duration_ms,
            },
            run_id: state.run_id,
            model: self.config.model.clone(),
            status,
            slots: state.slots,
            usage,
        })
    }

    /// Spawned tasks drained through `FuturesUnordered`. Returns whether the
    /// run was interrupted.
    async fn dispatch_concurrent(
        &self,
        state: &mut RunState<'_>,
        gate: &Arc<ConcurrencyGate>,
        pending: Vec<usize>,
    ) -> Result<bool> {
        let lookahead = gate.capacity() + self.config.checkpoint_batch_size;
        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut aborts: HashMap<usize, AbortHandle> = HashMap::new();
        let mut shutdown = self.shutdown.clone();
        let mut interrupted = false;

        loop {
            while !interrupted && in_flight.len() < lookahead {
                let Some(index) = queue.next() else { break };
                let (task, abort) = self.spawn_evaluation(index, &state.candidates, gate);
                aborts.insert(index, abort);
                in_flight.push(task);
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown), if !interrupted => {
                    info!(in_flight = in_flight.len(), "shutdown requested; finishing in-flight calls");
                    interrupted = true;
                    gate.close();
                }
                Some((index, joined)) = in_flight.next() => {
                    aborts.remove(&index);
                    if let Err(fatal) = state.accept(index, joined) {
                        gate.close();
                        for abort in aborts.values() {
                            abort.abort();
                        }
                        return Err(fatal);
                    }
                }
            }
        }
        Ok(interrupted)
    }

    fn spawn_evaluation(
        &self,
        index: usize,
        candidates: &Arc<[CandidateRecord]>,
        gate: &Arc<ConcurrencyGate>,
    ) -> (
        impl std::future::Future<Output = (usize, Joined)>,
        AbortHandle,
    ) {
        let evaluator = self.evaluator.clone();
        let candidates = Arc::clone(candidates);
        let gate = Arc::clone(gate);
        let handle = tokio::spawn(
            async move { evaluator.evaluate(&candidates[index], &gate).await }
                .instrument(Span::current()),
        );
        let abort = handle.abort_handle();
        (async move { (index, handle.await) }, abort)
    }

    /// In input order on the driving task. The shutdown signal is checked
    /// between candidates.
    async fn dispatch_sequential(
        &self,
        state: &mut RunState<'_>,
        gate: &ConcurrencyGate,
        pending: Vec<usize>,
    ) -> Result<bool> {
        for index in pending {
            if self.shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                info!(next_index = index, "shutdown requested; stopping before next candidate");
                gate.close();
                return Ok(true);
            }
            let candidate = &state.candidates[index];
            let joined = AssertUnwindSafe(self.evaluator.evaluate(candidate, gate))
                .catch_unwind()
                .await
                .map_err(|panic| panic_detail(panic.as_ref()));
            state.accept_sequential(index, joined)?;
        }
        Ok(false)
    }
}

type Joined = std::result::Result<std::result::Result<Evaluation, EvaluateError>, JoinError>;

async fn shutdown_requested(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending::<()>().await,
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Run-local state, owned by the driving task.
struct RunState<'a> {
    orchestrator: &'a Orchestrator,
    run_id: String,
    candidates: Arc<[CandidateRecord]>,
    slots: Vec<Option<EvaluationOutcome>>,
    accountant: TokenAccountant,
    resumed_from: Option<usize>,
    watermark: usize,
    /// Highest `next_index` successfully persisted.
    committed: usize,
    /// Highest boundary a write was attempted for.
    attempted: usize,
    /// Something changed since the last successful write.
    dirty: bool,
    filled: usize,
    matched: usize,
    failed: usize,
    evaluated_this_run: usize,
    checkpoints_written: usize,
    checkpoint_write_failures: usize,
}

impl<'a> RunState<'a> {
    fn new(
        run_id: String,
        candidates: Arc<[CandidateRecord]>,
        slots: Vec<Option<EvaluationOutcome>>,
        accountant: TokenAccountant,
        resumed_from: Option<usize>,
        orchestrator: &'a Orchestrator,
    ) -> Self {
        let outcomes = slots.iter().flatten();
        let filled = outcomes.clone().count();
        let matched = outcomes.clone().filter(|o| o.is_target()).count();
        let failed = outcomes.filter(|o| o.is_failure()).count();
        let mut state = Self {
            orchestrator,
            run_id,
            candidates,
            slots,
            accountant,
            resumed_from,
            watermark: 0,
            committed: resumed_from.unwrap_or(0),
            attempted: resumed_from.unwrap_or(0),
            dirty: false,
            filled,
            matched,
            failed,
            evaluated_this_run: 0,
            checkpoints_written: 0,
            checkpoint_write_failures: 0,
        };
        state.advance_watermark();
        state
    }

    fn total(&self) -> usize {
        self.slots.len()
    }

    fn batch_size(&self) -> usize {
        self.orchestrator.config.checkpoint_batch_size
    }

    fn advance_watermark(&mut self) {
        while self.watermark < self.total() && self.slots[self.watermark].is_some() {
            self.watermark += 1;
        }
    }

    /// Fold a spawned task's result into the run. Only fatal errors escape.
    fn accept(&mut self, index: usize, joined: Joined) -> Result<()> {
        let evaluated = match joined {
            Ok(evaluated) => evaluated,
            Err(join_error) => Ok(self.task_failed(index, &join_error.to_string())),
        };
        self.settle(index, evaluated)
    }

    fn accept_sequential(
        &mut self,
        index: usize,
        joined: std::result::Result<std::result::Result<Evaluation, EvaluateError>, String>,
    ) -> Result<()> {
        let evaluated = match joined {
            Ok(evaluated) => evaluated,
            Err(panic) => Ok(self.task_failed(index, &panic)),
        };
        self.settle(index, evaluated)
    }

    fn task_failed(&self, index: usize, detail: &str) -> Evaluation {
        let candidate = &self.candidates[index];
        Evaluation {
            outcome: EvaluationOutcome::Failure(FailureMarker::new(
                candidate,
                FailureCause::TaskFailed {
                    detail: detail.to_string(),
                },
                TokenUsage::empty(self.orchestrator.evaluator.model_id()),
                0,
            )),
            usages: Vec::new(),
        }
    }

    fn settle(
        &mut self,
        index: usize,
        evaluated: std::result::Result<Evaluation, EvaluateError>,
    ) -> Result<()> {
        match evaluated {
            Ok(evaluation) => {
                self.record(index, evaluation);
                self.commit_if_boundary();
                Ok(())
            }
            Err(EvaluateError::Cancelled { usages }) => {
                self.record_usages(index, &usages);
                Ok(())
            }
            Err(EvaluateError::Fatal(err)) => Err(err),
        }
    }

    fn record_usages(&mut self, index: usize, usages: &[(u32, TokenUsage)]) {
        let candidate_id = &self.candidates[index].id;
        for (attempt, usage) in usages {
            self.accountant.record(candidate_id, *attempt, usage);
        }
        if !usages.is_empty() {
            self.dirty = true;
        }
    }

    fn record(&mut self, index: usize, evaluation: Evaluation) {
        self.record_usages(index, &evaluation.usages);
        let outcome = evaluation.outcome;

        METRICS.inc_candidates_evaluated();
        if outcome.is_target() {
            self.matched += 1;
        }
        if let EvaluationOutcome::Failure(marker) = &outcome {
            METRICS.inc_candidates_failed();
            self.failed += 1;
            obs::emit_candidate_failed(&self.run_id, index, &marker.candidate_id, &marker.cause);
        }

        self.slots[index] = Some(outcome);
        self.filled += 1;
        self.evaluated_this_run += 1;
        self.dirty = true;
        self.advance_watermark();
    }

    /// Commit when the watermark has crossed a chunk boundary that is not
    /// yet persisted. A failed write is retried at the next boundary.
    fn commit_if_boundary(&mut self) {
        let boundary = if self.watermark == self.total() {
            self.watermark
        } else {
            self.watermark / self.batch_size() * self.batch_size()
        };
        if boundary > self.attempted {
            self.commit(boundary);
        }
    }

    /// End of run: persist everything gathered, at the watermark.
    fn commit_final(&mut self) {
        if self.dirty || self.watermark > self.committed {
            self.commit(self.watermark);
        }
    }

    fn commit(&mut self, next_index: usize) {
        let orchestrator = self.orchestrator;
        self.attempted = self.attempted.max(next_index);
        let cost = self.accountant.estimate_cost().total_cost_usd;
        let report = ProgressReport {
            run_id: self.run_id.clone(),
            evaluated: self.filled,
            matched: self.matched,
            failed: self.failed,
            next_index,
            total: self.total(),
            total_tokens: self.accountant.totals().total_tokens,
            estimated_cost_usd: cost,
        };

        match &orchestrator.store {
            Some(store) => {
                let checkpoint = Checkpoint::new(
                    self.run_id.clone(),
                    &self.candidates,
                    next_index,
                    self.slots.clone(),
                    self.accountant.snapshot(),
                    orchestrator.config.model.clone(),
                );
                match store.save(&checkpoint) {
                    Ok(_) => {
                        METRICS.inc_checkpoints_written();
                        self.checkpoints_written += 1;
                        self.committed = next_index;
                        self.dirty = false;
                        if let Err(err) = store.prune(orchestrator.config.checkpoints_kept) {
                            warn!(error = %err, "failed to prune old checkpoints");
                        }
                    }
                    Err(err) => {
                        self.checkpoint_write_failures += 1;
                        obs::emit_checkpoint_write_failed(&self.run_id, next_index, &err);
                    }
                }
            }
            None => {
                self.committed = next_index;
                self.dirty = false;
            }
        }

        obs::emit_chunk_committed(
            &self.run_id,
            next_index,
            report.evaluated,
            report.matched,
            report.failed,
            report.total_tokens,
            report.estimated_cost_usd,
        );
        if let Some(tx) = &orchestrator.progress {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::domain::SiftError;
    use crate::fakes::{candidates, deterministic_reply, reply_json, FakeModel};
    use crate::model::ModelError;

    fn config(mode: ExecutionMode, concurrency: usize, batch: usize) -> EngineConfig {
        EngineConfig::default()
            .with_mode(mode)
            .with_concurrency(concurrency)
            .with_checkpoint_batch_size(batch)
            .with_call_delay(Duration::ZERO)
    }

    fn orchestrator(model: Arc<FakeModel>, cfg: EngineConfig) -> Orchestrator {
        let evaluator = Evaluator::new(model, &cfg);
        Orchestrator::new(cfg, evaluator).unwrap()
    }

    #[test]
    fn test_select_window() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(select_window(&items, 0, None), &items[..]);
        assert_eq!(select_window(&items, 3, Some(4)), &[3, 4, 5, 6]);
        assert_eq!(select_window(&items, 8, Some(5)), &[8, 9]);
        assert!(select_window(&items, 20, None).is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let cfg = EngineConfig::default().with_checkpoint_batch_size(0);
        let evaluator = Evaluator::new(Arc::new(FakeModel::deterministic()), &cfg);
        assert!(matches!(
            Orchestrator::new(cfg, evaluator),
            Err(SiftError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_index_aligned_despite_out_of_order_completion() {
        let model = Arc::new(FakeModel::deterministic().with_jitter(Duration::from_millis(10)));
        let input: Arc<[CandidateRecord]> = candidates(25).into();
        let report = orchestrator(model, config(ExecutionMode::Concurrent, 8, 10))
            .run(Arc::clone(&input), None)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.slots.len(), 25);
        for (candidate, outcome) in input.iter().zip(report.outcomes()) {
            assert_eq!(outcome.candidate_id(), candidate.id);
        }
        assert_eq!(report.stats.evaluated_this_run, 25);
        assert!(report.stats.peak_in_flight <= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reported_per_chunk() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let model = Arc::new(FakeModel::deterministic());
        let dir = tempfile::tempdir().unwrap();
        let report = orchestrator(model, config(ExecutionMode::Sequential, 1, 10))
            .with_checkpoints(CheckpointStore::new(dir.path()))
            .with_progress(tx)
            .run(candidates(25).into(), None)
            .await
            .unwrap();

        let mut boundaries = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            boundaries.push(progress.next_index);
        }
        assert_eq!(boundaries, vec![10, 20, 25]);
        assert_eq!(report.stats.checkpoints_written, 3);
        assert_eq!(report.usage.totals.calls, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_run() {
        let model = Arc::new(FakeModel::new(|id, _, _| match id {
            "c-0003" => Err(ModelError::refused("no")),
            "c-0004" => panic!("fake model exploded"),
            _ => Ok(deterministic_reply(id)),
        }));
        let report = orchestrator(model, config(ExecutionMode::Concurrent, 4, 5))
            .run(candidates(10).into(), None)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.stats.failed, 2);
        let causes: Vec<_> = report
            .outcomes()
            .filter_map(|o| match o {
                EvaluationOutcome::Failure(m) => Some((m.candidate_id.clone(), m.cause.clone())),
                _ => None,
            })
            .collect();
        assert!(matches!(causes[0].1, FailureCause::ContentRefusal { .. }));
        assert!(matches!(causes[1].1, FailureCause::TaskFailed { .. }));
        assert_eq!(causes[1].0, "c-0004");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_panic_becomes_marker() {
        let model = Arc::new(FakeModel::new(|id, _, _| match id {
            "c-0001" => panic!("boom"),
            _ => Ok(reply_json(8, 8, 8, true)),
        }));
        let report = orchestrator(model, config(ExecutionMode::Sequential, 1, 2))
            .run(candidates(3).into(), None)
            .await
            .unwrap();
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.matched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_aborts_without_checkpoint() {
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(ModelError::Unauthorized { status: 401 })
        }));
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        let err = orchestrator(model, config(ExecutionMode::Concurrent, 4, 5))
            .with_checkpoints(store.clone())
            .run(candidates(10).into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SiftError::ModelUnauthorized(_)));
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_and_checkpoints() {
        let model = Arc::new(FakeModel::deterministic().with_latency(Duration::from_millis(100)));
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        let input: Arc<[CandidateRecord]> = candidates(40).into();

        let orch = orchestrator(Arc::clone(&model), config(ExecutionMode::Concurrent, 4, 10))
            .with_checkpoints(store.clone())
            .with_shutdown(stop_rx);
        let run = orch.run(Arc::clone(&input), None);
        let stop = async {
            model.wait_for_calls(10).await;
            stop_tx.send(true).unwrap();
        };
        let (report, ()) = tokio::join!(run, stop);
        let report = report.unwrap();

        let RunStatus::Interrupted { next_index } = report.status else {
            panic!("expected interruption, got {:?}", report.status);
        };
        assert!(next_index < 40);
        assert!(model.total_calls() < 40);

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.next_index, next_index);
        assert_eq!(latest.recorded(), report.outcomes().count());
        latest.verify_against(&input).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_checkpoints_are_pruned_during_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let model = Arc::new(FakeModel::deterministic());
        let input: Arc<[CandidateRecord]> = candidates(100).into();
        let report = orchestrator(model, config(ExecutionMode::Sequential, 1, 10))
            .with_checkpoints(store.clone())
            .run(Arc::clone(&input), None)
            .await
            .unwrap();

        assert_eq!(report.stats.checkpoints_written, 10);
        let kept: Vec<usize> = store.list().unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(kept, vec![90, 100]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        store.load_latest().unwrap().unwrap().verify_against(&input).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoints_kept_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let model = Arc::new(FakeModel::deterministic());
        let cfg = config(ExecutionMode::Concurrent, 4, 10).with_checkpoints_kept(1);
        orchestrator(model, cfg)
            .with_checkpoints(store.clone())
            .run(candidates(45).into(), None)
            .await
            .unwrap();

        let kept: Vec<usize> = store.list().unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(kept, vec![45]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_write_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the checkpoint directory should be.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let model = Arc::new(FakeModel::deterministic());
        let report = orchestrator(model, config(ExecutionMode::Sequential, 1, 5))
            .with_checkpoints(CheckpointStore::new(&blocked))
            .run(candidates(10).into(), None)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.stats.checkpoints_written, 0);
        // Boundary 5, boundary 10, then the final attempt.
        assert_eq!(report.stats.checkpoint_write_failures, 3);
        assert_eq!(report.outcomes().count(), 10);
    }
}
