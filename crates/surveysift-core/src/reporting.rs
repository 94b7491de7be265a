use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::accounting::TokenSummary;
use crate::domain::{EvaluationOutcome, EvaluationResult};
use crate::orchestrator::{RunReport, RunStatus};

/// Short usage block embedded in the primary result document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageBrief {
    pub total_api_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl From<&TokenSummary> for UsageBrief {
    fn from(summary: &TokenSummary) -> Self {
        Self {
            total_api_calls: summary.totals.calls,
            prompt_tokens: summary.totals.prompt_tokens,
            completion_tokens: summary.totals.completion_tokens,
            total_tokens: summary.totals.total_tokens,
            estimated_cost_usd: summary.cost_estimate.total_cost_usd,
        }
    }
}

/// Metadata section of `<output>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub run_id: String,
    pub status: RunStatus,
    pub total_evaluated: usize,
    pub matched_count: usize,
    pub failed_count: usize,
    /// `matched_count / total_evaluated`, 0 when nothing was evaluated.
    pub success_rate: f64,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub token_usage_summary: UsageBrief,
}

/// The primary result document: metadata plus matched papers in input order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultDocument {
    pub metadata: ResultMetadata,
    pub papers: Vec<EvaluationResult>,
}

impl ResultDocument {
    pub fn from_report(report: &RunReport) -> Self {
        let total = report.outcomes().count();
        let papers: Vec<EvaluationResult> = report.matched().cloned().collect();
        let failed = report.outcomes().filter(|o| o.is_failure()).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            papers.len() as f64 / total as f64
        };
        Self {
            metadata: ResultMetadata {
                run_id: report.run_id.clone(),
                status: report.status,
                total_evaluated: total,
                matched_count: papers.len(),
                failed_count: failed,
                success_rate,
                model: report.model.clone(),
                generated_at: Utc::now(),
                token_usage_summary: UsageBrief::from(&report.usage),
            },
            papers,
        }
    }
}

/// Every outcome, index-aligned with the input (`null` for unfinished slots).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllEvaluationsDocument {
    pub run_id: String,
    pub total: usize,
    pub evaluations: Vec<Option<EvaluationOutcome>>,
}

impl AllEvaluationsDocument {
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            total: report.slots.len(),
            evaluations: report.slots.clone(),
        }
    }
}

/// Where each document for one output stem lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub results: PathBuf,
    pub all_evaluations: PathBuf,
    pub token_stats: PathBuf,
    pub text_report: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl OutputPaths {
    /// `out/papers.json` gives `out/papers_all_evaluations.json`,
    /// `out/papers_token_stats.json`, `out/papers_report.txt` and
    /// `out/papers_checkpoints/`.
    pub fn for_output(output: &Path) -> Self {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_string());
        let sibling = |suffix: &str| output.with_file_name(format!("{stem}{suffix}"));
        Self {
            results: output.to_path_buf(),
            all_evaluations: sibling("_all_evaluations.json"),
            token_stats: sibling("_token_stats.json"),
            text_report: sibling("_report.txt"),
            checkpoint_dir: sibling("_checkpoints"),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(value).with_context(|| format!("serialize {what}"))?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write `<output>.json` in pretty JSON format.
pub fn write_results_json(path: &Path, document: &ResultDocument) -> Result<()> {
    write_json(path, document, "result document")
}

/// Write `<output>_all_evaluations.json`.
pub fn write_all_evaluations_json(path: &Path, document: &AllEvaluationsDocument) -> Result<()> {
    write_json(path, document, "evaluation document")
}

/// Write `<output>_token_stats.json`.
pub fn write_token_stats_json(path: &Path, summary: &TokenSummary) -> Result<()> {
    write_json(path, summary, "token statistics")
}

/// Render the plain-text run summary.
pub fn render_text_report(report: &RunReport) -> String {
    let doc = ResultDocument::from_report(report);
    let meta = &doc.metadata;
    let usage = &report.usage;

    let mut out = String::new();
    out.push_str("Survey Screening Report\n");
    out.push_str(&"=".repeat(50));
    out.push_str("\n\n");

    out.push_str("Summary:\n");
    out.push_str(&format!(
        "  evaluated: {}\n  matched: {}\n  failed: {}\n  success rate: {:.1}%\n",
        meta.total_evaluated,
        meta.matched_count,
        meta.failed_count,
        meta.success_rate * 100.0
    ));
    if let RunStatus::Interrupted { next_index } = meta.status {
        out.push_str(&format!("  interrupted: resume from index {next_index}\n"));
    }
    out.push('\n');

    out.push_str("Token usage:\n");
    out.push_str(&format!(
        "  api calls: {}\n  total tokens: {} (prompt {}, completion {})\n  avg tokens per call: {:.1}\n  estimated cost: ${:.4} USD\n  cost per paper: ${:.4} USD\n  model: {}\n",
        usage.totals.calls,
        usage.totals.total_tokens,
        usage.totals.prompt_tokens,
        usage.totals.completion_tokens,
        usage.efficiency.avg_total_tokens,
        usage.cost_estimate.total_cost_usd,
        usage.efficiency.cost_per_candidate_usd,
        meta.model,
    ));

    if !doc.papers.is_empty() {
        let scores: Vec<f64> = doc.papers.iter().map(|p| p.overall_score).collect();
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out.push_str(&format!(
            "\nMatched papers:\n  average score: {avg:.2}\n  score range: {min:.1} - {max:.1}\n"
        ));

        let mut top: Vec<&EvaluationResult> = doc.papers.iter().collect();
        // Stable sort keeps input order among equal scores.
        top.sort_by(|a, b| b.overall_score.total_cmp(&a.overall_score));
        out.push_str("\nTop papers:\n");
        for (rank, paper) in top.iter().take(10).enumerate() {
            out.push_str(&format!(
                "\n{}. {}\n   id: {}\n   score: {:.1}\n   topics: {}\n   reasoning: {}\n",
                rank + 1,
                paper.title,
                paper.candidate_id,
                paper.overall_score,
                paper.key_topics.join(", "),
                paper.reasoning,
            ));
        }
    }
    out
}

/// Write `<output>_report.txt`.
pub fn write_text_report(path: &Path, report: &RunReport) -> Result<()> {
    std::fs::write(path, render_text_report(report)).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
