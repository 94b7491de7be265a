//! Token usage accounting and cost estimation.
//!
//! The accountant receives one [`TokenUsage`] per call attempt, retried and
//! failed attempts included, and prices the running totals with a static
//! per-model table. It never touches evaluation results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::TokenUsage;

/// USD price per 1,000 tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPrice {
    pub const fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    /// `prompt/1000 * price_prompt + completion/1000 * price_completion`.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }
}

/// Model id to price lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PriceTable {
    /// Published list prices; unknown models are priced like gpt-4.
    pub fn standard() -> Self {
        let gpt4 = ModelPrice::new(0.03, 0.06);
        let prices = BTreeMap::from([
            ("gpt-4".to_string(), gpt4),
            ("gpt-4-turbo".to_string(), ModelPrice::new(0.01, 0.03)),
            ("gpt-4o".to_string(), ModelPrice::new(0.005, 0.015)),
            ("gpt-4o-mini".to_string(), ModelPrice::new(0.00015, 0.0006)),
            ("gpt-3.5-turbo".to_string(), ModelPrice::new(0.0015, 0.002)),
        ]);
        Self {
            prices,
            fallback: gpt4,
        }
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into().to_lowercase(), price);
        self
    }

    pub fn with_overrides<'a>(
        self,
        overrides: impl IntoIterator<Item = (&'a String, &'a ModelPrice)>,
    ) -> Self {
        overrides
            .into_iter()
            .fold(self, |table, (model, price)| table.with_price(model.clone(), *price))
    }

    /// Exact id, else the longest known id contained in `model`, else `None`.
    pub fn lookup(&self, model: &str) -> Option<ModelPrice> {
        let model = model.to_lowercase();
        if let Some(price) = self.prices.get(&model) {
            return Some(*price);
        }
        self.prices
            .iter()
            .filter(|(key, _)| model.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| *price)
    }

    /// Like [`lookup`](Self::lookup) but falls back to the default price.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.lookup(model).unwrap_or(self.fallback)
    }
}

/// Running totals for one model (or for everything).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
}

impl UsageTotals {
    fn add(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.calls += 1;
    }
}

/// One recorded call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub candidate_id: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub usage: TokenUsage,
    pub recorded_at: DateTime<Utc>,
}

/// Serializable accountant state, carried inside checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountantSnapshot {
    pub totals: UsageTotals,
    pub per_model: BTreeMap<String, UsageTotals>,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
}

/// Cost breakdown derived from the current totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub prompt_cost_usd: f64,
    pub completion_cost_usd: f64,
    pub total_cost_usd: f64,
    pub per_model_usd: BTreeMap<String, f64>,
}

/// Derived efficiency metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyMetrics {
    pub total_api_calls: u64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub avg_total_tokens: f64,
    pub candidates_evaluated: usize,
    pub cost_per_candidate_usd: f64,
}

/// The token-statistics document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub totals: UsageTotals,
    pub per_model: BTreeMap<String, UsageTotals>,
    pub cost_estimate: CostEstimate,
    pub efficiency: EfficiencyMetrics,
    pub per_call: Vec<CallRecord>,
}

/// Accumulates usage across a run.
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    prices: PriceTable,
    state: AccountantSnapshot,
}

impl TokenAccountant {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            state: AccountantSnapshot::default(),
        }
    }

    /// Resume from a checkpointed snapshot.
    pub fn restore(prices: PriceTable, snapshot: AccountantSnapshot) -> Self {
        Self {
            prices,
            state: snapshot,
        }
    }

    pub fn snapshot(&self) -> AccountantSnapshot {
        self.state.clone()
    }

    /// Record one call attempt.
    pub fn record(&mut self, candidate_id: &str, attempt: u32, usage: &TokenUsage) {
        if self.prices.lookup(&usage.model).is_none() {
            warn!(model = %usage.model, "no price for model; using fallback pricing");
        }
        self.state.totals.add(usage);
        self.state
            .per_model
            .entry(usage.model.clone())
            .or_default()
            .add(usage);
        self.state.calls.push(CallRecord {
            candidate_id: candidate_id.to_string(),
            attempt,
            usage: usage.clone(),
            recorded_at: Utc::now(),
        });
    }

    pub fn totals(&self) -> &UsageTotals {
        &self.state.totals
    }

    pub fn calls(&self) -> u64 {
        self.state.totals.calls
    }

    /// Price every model's totals and sum.
    pub fn estimate_cost(&self) -> CostEstimate {
        let mut prompt_cost = 0.0;
        let mut completion_cost = 0.0;
        let mut per_model = BTreeMap::new();
        for (model, totals) in &self.state.per_model {
            let price = self.prices.price_for(model);
            let p = price.cost(totals.prompt_tokens, 0);
            let c = price.cost(0, totals.completion_tokens);
            prompt_cost += p;
            completion_cost += c;
            per_model.insert(model.clone(), p + c);
        }
        CostEstimate {
            prompt_cost_usd: prompt_cost,
            completion_cost_usd: completion_cost,
            total_cost_usd: prompt_cost + completion_cost,
            per_model_usd: per_model,
        }
    }

    pub fn average_tokens_per_call(&self) -> f64 {
        per_call(self.state.totals.total_tokens, self.state.totals.calls)
    }

    /// Total cost divided by the number of evaluated candidates.
    pub fn cost_per_candidate(&self, candidates_evaluated: usize) -> f64 {
        if candidates_evaluated == 0 {
            return 0.0;
        }
        self.estimate_cost().total_cost_usd / candidates_evaluated as f64
    }

    pub fn summary(&self, candidates_evaluated: usize) -> TokenSummary {
        let totals = &self.state.totals;
        TokenSummary {
            totals: totals.clone(),
            per_model: self.state.per_model.clone(),
            cost_estimate: self.estimate_cost(),
            efficiency: EfficiencyMetrics {
                total_api_calls: totals.calls,
                avg_prompt_tokens: per_call(totals.prompt_tokens, totals.calls),
                avg_completion_tokens: per_call(totals.completion_tokens, totals.calls),
                avg_total_tokens: per_call(totals.total_tokens, totals.calls),
                candidates_evaluated,
                cost_per_candidate_usd: self.cost_per_candidate(candidates_evaluated),
            },
            per_call: self.state.calls.clone(),
        }
    }
}

fn per_call(tokens: u64, calls: u64) -> f64 {
    if calls == 0 {
        0.0
    } else {
        tokens as f64 / calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_gpt4_cost_arithmetic() {
        let mut acct = TokenAccountant::new(PriceTable::standard());
        acct.record("p1", 1, &TokenUsage::new("gpt-4", 750, 120));
        let cost = acct.estimate_cost();
        assert!(approx(cost.prompt_cost_usd, 0.0225));
        assert!(approx(cost.completion_cost_usd, 0.0072));
        assert!(approx(cost.total_cost_usd, 0.0297));
    }

    #[test]
    fn test_failed_attempts_still_count() {
        let mut acct = TokenAccountant::new(PriceTable::standard());
        acct.record("p1", 1, &TokenUsage::new("gpt-4", 500, 40));
        acct.record("p1", 2, &TokenUsage::new("gpt-4", 520, 60));
        assert_eq!(acct.calls(), 2);
        assert_eq!(acct.totals().prompt_tokens, 1020);
        assert_eq!(acct.totals().total_tokens, 1120);
        assert!(approx(acct.average_tokens_per_call(), 560.0));
    }

    #[test]
    fn test_costs_sum_across_models() {
        let mut acct = TokenAccountant::new(PriceTable::standard());
        acct.record("a", 1, &TokenUsage::new("gpt-4", 1000, 1000));
        acct.record("b", 1, &TokenUsage::new("gpt-3.5-turbo", 1000, 1000));
        let cost = acct.estimate_cost();
        assert!(approx(cost.per_model_usd["gpt-4"], 0.09));
        assert!(approx(cost.per_model_usd["gpt-3.5-turbo"], 0.0035));
        assert!(approx(cost.total_cost_usd, 0.0935));
    }

    #[test]
    fn test_lookup_prefers_longest_match() {
        let table = PriceTable::standard();
        assert_eq!(table.lookup("gpt-4-turbo-2024-04-09"), Some(ModelPrice::new(0.01, 0.03)));
        assert_eq!(table.lookup("gpt-4o-mini"), Some(ModelPrice::new(0.00015, 0.0006)));
        assert_eq!(table.lookup("GPT-4-0613"), Some(ModelPrice::new(0.03, 0.06)));
        assert_eq!(table.lookup("qwen-max"), None);
        assert_eq!(table.price_for("qwen-max"), ModelPrice::new(0.03, 0.06));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = BTreeMap::from([("qwen-max".to_string(), ModelPrice::new(0.002, 0.006))]);
        let table = PriceTable::standard().with_overrides(&overrides);
        assert_eq!(table.price_for("qwen-max"), ModelPrice::new(0.002, 0.006));
    }

    #[test]
    fn test_cost_per_candidate_and_empty_state() {
        let acct = TokenAccountant::new(PriceTable::standard());
        assert_eq!(acct.average_tokens_per_call(), 0.0);
        assert_eq!(acct.cost_per_candidate(0), 0.0);

        let mut acct = acct;
        acct.record("a", 1, &TokenUsage::new("gpt-4", 1000, 0));
        acct.record("b", 1, &TokenUsage::new("gpt-4", 1000, 0));
        assert!(approx(acct.cost_per_candidate(2), 0.03));
    }

    #[test]
    fn test_snapshot_restore_preserves_totals() {
        let mut acct = TokenAccountant::new(PriceTable::standard());
        acct.record("a", 1, &TokenUsage::new("gpt-4", 750, 120));
        let snap = acct.snapshot();

        let mut resumed = TokenAccountant::restore(PriceTable::standard(), snap);
        resumed.record("b", 1, &TokenUsage::new("gpt-4", 750, 120));
        assert_eq!(resumed.calls(), 2);
        assert!(approx(resumed.estimate_cost().total_cost_usd, 0.0594));

        let summary = resumed.summary(2);
        assert_eq!(summary.per_call.len(), 2);
        assert_eq!(summary.efficiency.total_api_calls, 2);
        assert!(approx(summary.efficiency.cost_per_candidate_usd, 0.0297));
    }
}
