//! In-memory fake model client (testing only)
//!
//! `FakeModel` implements [`ModelClient`] with a scripted responder, optional
//! latency, and call bookkeeping (per-candidate call counts, concurrent peak)
//! so orchestrator and evaluator behaviour can be asserted without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::TokenUsage;
use crate::model::{ModelClient, ModelError, ModelReply, ModelRequest};

/// `(candidate_id, call_number_for_that_candidate, prompt) -> reply text`.
pub type Responder = dyn Fn(&str, u32, &str) -> Result<String, ModelError> + Send + Sync;

/// Prompt tokens charged per fake call.
pub const FAKE_PROMPT_TOKENS: u64 = 100;
/// Completion tokens charged per fake call.
pub const FAKE_COMPLETION_TOKENS: u64 = 20;

/// Scripted [`ModelClient`].
pub struct FakeModel {
    responder: Arc<Responder>,
    latency: Box<dyn Fn(&str) -> Duration + Send + Sync>,
    stalled: HashSet<String>,
    calls: Mutex<Vec<String>>,
    per_id: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl std::fmt::Debug for FakeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeModel")
            .field("calls", &self.total_calls())
            .field("peak", &self.peak())
            .finish_non_exhaustive()
    }
}

impl FakeModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, u32, &str) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            latency: Box::new(|_| Duration::ZERO),
            stalled: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            per_id: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every candidate gets the same well-formed reply.
    pub fn always(reply: String) -> Self {
        Self::new(move |_, _, _| Ok(reply.clone()))
    }

    /// Scores derived from a hash of the candidate id: stable across runs,
    /// varied across candidates.
    pub fn deterministic() -> Self {
        Self::new(|id, _, _| Ok(deterministic_reply(id)))
    }

    /// Fixed latency for every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Box::new(move |_| latency);
        self
    }

    /// Latency that varies by candidate, so completions arrive out of order.
    pub fn with_jitter(mut self, base: Duration) -> Self {
        self.latency = Box::new(move |id| base * (1 + u32::from(id_hash(id)[0] % 7)));
        self
    }

    /// Calls for this candidate never return.
    pub fn with_stall(mut self, candidate_id: impl Into<String>) -> Self {
        self.stalled.insert(candidate_id.into());
        self
    }

    /// Candidate ids in the order their calls started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, candidate_id: &str) -> u32 {
        self.per_id
            .lock()
            .unwrap()
            .get(candidate_id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls ever in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.total_calls() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

struct InFlight<'a>(&'a FakeModel);

impl<'a> InFlight<'a> {
    fn enter(model: &'a FakeModel) -> Self {
        let now = model.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        model.peak.fetch_max(now, Ordering::SeqCst);
        Self(model)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        let id = request.correlation_id.clone();
        let call_number = {
            self.calls.lock().unwrap().push(id.clone());
            let mut per_id = self.per_id.lock().unwrap();
            let n = per_id.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let _guard = InFlight::enter(self);

        if self.stalled.contains(&id) {
            std::future::pending::<()>().await;
        }
        let latency = (self.latency)(&id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let text = (self.responder)(&id, call_number, &request.prompt)?;
        Ok(ModelReply {
            text,
            usage: TokenUsage::new(request.model, FAKE_PROMPT_TOKENS, FAKE_COMPLETION_TOKENS),
        })
    }
}

fn id_hash(id: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(id.as_bytes()));
    out
}

/// A schema-conforming reply with the given scores.
pub fn reply_json(relevance: u8, survey: u8, quality: u8, is_survey: bool) -> String {
    serde_json::json!({
        "relevance_score": relevance,
        "survey_score": survey,
        "quality_score": quality,
        "is_survey": is_survey,
        "reasoning": "scripted reply",
        "survey_indicators": if is_survey { vec!["taxonomy"] } else { vec![] },
        "key_topics": ["graph neural networks"]
    })
    .to_string()
}

/// Reply whose scores are a pure function of the candidate id.
pub fn deterministic_reply(candidate_id: &str) -> String {
    let h = id_hash(candidate_id);
    let score = |b: u8| 1 + b % 10;
    reply_json(score(h[1]), score(h[2]), score(h[3]), h[4] % 3 != 0)
}

/// Build a numbered batch of candidates `c-0000`, `c-0001`, ...
pub fn candidates(n: usize) -> Vec<crate::domain::CandidateRecord> {
    use chrono::{Duration as Days, TimeZone, Utc};
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
    (0..n)
        .map(|i| {
            crate::domain::CandidateRecord::new(
                format!("c-{i:04}"),
                format!("Candidate paper {i}: a survey of graph learning"),
                format!("Abstract number {i} about graph neural networks."),
                vec!["cs.LG".to_string()],
                base + Days::days(i as i64),
            )
        })
        .collect()
}
