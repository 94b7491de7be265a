//! surveysift CLI
//!
//! The `surveysift` command screens a file of paper records with a language
//! model and keeps the survey papers of the configured target domain.
//!
//! ## Commands
//!
//! - `run`: evaluate candidates, checkpointing as it goes and resuming from
//!   the latest checkpoint when one exists
//! - `status`: show the latest checkpoint of an output

mod input;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use surveysift_core::reporting::{
    write_all_evaluations_json, write_results_json, write_text_report, write_token_stats_json,
    AllEvaluationsDocument,
};
use surveysift_core::{
    select_window, CheckpointStore, EngineConfig, Evaluator, ExecutionMode, OpenAiClient,
    Orchestrator, OutputPaths, ProgressReport, ResultDocument, RunStatus, SiftConfig,
    TokenAccountant,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "surveysift")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Find survey papers in a batch of paper records with an LLM", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a candidate file and write the result documents
    Run(RunArgs),

    /// Show the latest checkpoint for an output
    Status {
        /// Primary output path the checkpoints belong to
        #[arg(short, long, default_value = "survey_papers.json")]
        output: PathBuf,

        /// Checkpoint directory (default: <output stem>_checkpoints)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Candidate records: a JSON array or JSON Lines file
    input: PathBuf,

    /// Primary result document
    #[arg(short, long, default_value = "survey_papers.json")]
    output: PathBuf,

    /// TOML config file layered over the built-in defaults
    #[arg(short, long, env = "SURVEYSIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Model identifier
    #[arg(short, long)]
    model: Option<String>,

    /// API key (overrides LLM_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// API base URL (overrides LLM_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Maximum simultaneous model calls
    #[arg(long)]
    concurrency: Option<usize>,

    /// Candidates per checkpoint
    #[arg(long)]
    batch_size: Option<usize>,

    /// Minimum spacing between call starts, in milliseconds
    #[arg(long)]
    call_delay_ms: Option<u64>,

    /// One candidate at a time
    #[arg(long)]
    sequential: bool,

    /// Skip this many candidates (after the --months filter)
    #[arg(long)]
    start_index: Option<usize>,

    /// Evaluate at most this many candidates
    #[arg(long)]
    max_candidates: Option<usize>,

    /// Only keep papers published in the last N 30-day months
    #[arg(long)]
    months: Option<u32>,

    /// Ignore and remove existing checkpoints
    #[arg(long)]
    no_resume: bool,

    /// Checkpoint directory (default: <output stem>_checkpoints)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint files kept on disk while the run progresses
    #[arg(long)]
    checkpoints_kept: Option<usize>,

    /// Keep checkpoints after a completed run
    #[arg(long)]
    keep_checkpoints: bool,

    /// Also write <output stem>_all_evaluations.json
    #[arg(long)]
    save_all_evaluations: bool,

    /// Also write <output stem>_token_stats.json
    #[arg(long)]
    save_token_stats: bool,

    /// Also write a plain-text <output stem>_report.txt
    #[arg(long)]
    report: bool,
}

impl RunArgs {
    /// Flags win over the file and the environment.
    fn apply(&self, mut config: SiftConfig) -> SiftConfig {
        let engine = &mut config.engine;
        if let Some(model) = &self.model {
            engine.model = model.clone();
        }
        if let Some(concurrency) = self.concurrency {
            engine.concurrency = concurrency;
        }
        if let Some(size) = self.batch_size {
            engine.checkpoint_batch_size = size;
        }
        if let Some(ms) = self.call_delay_ms {
            engine.call_delay_ms = ms;
        }
        if let Some(keep) = self.checkpoints_kept {
            engine.checkpoints_kept = keep;
        }
        if self.sequential {
            engine.mode = ExecutionMode::Sequential;
        }
        if let Some(start) = self.start_index {
            engine.start_index = start;
        }
        if self.max_candidates.is_some() {
            engine.max_candidates = self.max_candidates;
        }
        if let Some(key) = &self.api_key {
            config.endpoint.api_key = Some(key.clone());
        }
        if let Some(url) = &self.base_url {
            config.endpoint.base_url = url.clone();
        }
        config
    }

    fn checkpoint_store(&self) -> CheckpointStore {
        checkpoint_store(&self.output, self.checkpoint_dir.as_deref())
    }
}

fn checkpoint_store(output: &Path, dir: Option<&Path>) -> CheckpointStore {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| OutputPaths::for_output(output).checkpoint_dir);
    CheckpointStore::new(dir)
}

/// Defaults, then `--config`, then the environment, then flags.
fn resolve_config(args: &RunArgs) -> Result<SiftConfig> {
    let base = match &args.config {
        Some(path) => SiftConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => SiftConfig::default(),
    };
    let config = args.apply(base.from_process_env());
    config.engine.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    surveysift_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(&args).await,
        Commands::Status {
            output,
            checkpoint_dir,
        } => cmd_status(&output, checkpoint_dir.as_deref()),
    }
}

async fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let engine = &config.engine;

    let mut candidates = input::load_candidates(&args.input)?;
    let loaded = candidates.len();
    if let Some(months) = args.months {
        candidates = input::filter_recent(candidates, months, chrono::Utc::now());
        info!(loaded, kept = candidates.len(), months, "applied publication cutoff");
    }
    let window = select_window(&candidates, engine.start_index, engine.max_candidates).to_vec();
    if window.is_empty() {
        println!("No candidates to evaluate in {:?}", args.input);
        return Ok(());
    }

    let store = args.checkpoint_store();
    let resume = if args.no_resume {
        let removed = store.clear().context("Failed to clear old checkpoints")?;
        if removed > 0 {
            info!(removed, dir = ?store.dir(), "removed previous checkpoints");
        }
        None
    } else {
        store.load_latest().context("Failed to read checkpoints")?
    };
    if let Some(checkpoint) = &resume {
        println!(
            "Resuming run {} at {}/{} ({} recorded)",
            checkpoint.run_id,
            checkpoint.next_index,
            checkpoint.total_candidates,
            checkpoint.recorded()
        );
    }

    let client = OpenAiClient::new(&config.endpoint)?;
    let evaluator = Evaluator::new(Arc::new(client), engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight candidates");
            let _ = shutdown_tx.send(true);
        }
    });

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(progress_rx));

    let orchestrator = Orchestrator::new(engine.clone(), evaluator)?
        .with_checkpoints(store.clone())
        .with_progress(progress_tx)
        .with_shutdown(shutdown_rx);
    let report = orchestrator.run(window.into(), resume).await?;
    drop(orchestrator);
    printer.await.ok();

    let paths = OutputPaths::for_output(&args.output);
    write_results_json(&paths.results, &ResultDocument::from_report(&report))?;
    println!("Results written to {:?}", paths.results);
    if args.save_all_evaluations {
        write_all_evaluations_json(&paths.all_evaluations, &AllEvaluationsDocument::from_report(&report))?;
        println!("All evaluations written to {:?}", paths.all_evaluations);
    }
    if args.save_token_stats {
        write_token_stats_json(&paths.token_stats, &report.usage)?;
        println!("Token statistics written to {:?}", paths.token_stats);
    }
    if args.report {
        write_text_report(&paths.text_report, &report)?;
        println!("Report written to {:?}", paths.text_report);
    }

    let stats = &report.stats;
    println!();
    println!("Run:        {}", report.run_id);
    println!("Evaluated:  {}/{}", report.outcomes().count(), stats.total);
    println!("Matched:    {}", stats.matched);
    println!("Failed:     {}", stats.failed);
    println!(
        "Tokens:     {} over {} calls",
        report.usage.totals.total_tokens, report.usage.totals.calls
    );
    println!("Est. cost:  ${:.4}", report.usage.cost_estimate.total_cost_usd);

    match report.status {
        RunStatus::Completed => {
            if stats.checkpoint_write_failures > 0 {
                warn!(
                    failures = stats.checkpoint_write_failures,
                    "some checkpoint writes failed during the run"
                );
            }
            if !args.keep_checkpoints {
                store.clear().context("Failed to remove checkpoints")?;
            }
        }
        RunStatus::Interrupted { next_index } => {
            println!(
                "Interrupted at {}/{}; run the same command again to resume",
                next_index, stats.total
            );
        }
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressReport>) {
    while let Some(p) = rx.recv().await {
        println!(
            "[{}/{}] matched {}, failed {}, {} tokens, ~${:.4}",
            p.next_index, p.total, p.matched, p.failed, p.total_tokens, p.estimated_cost_usd
        );
    }
}

fn cmd_status(output: &Path, checkpoint_dir: Option<&Path>) -> Result<()> {
    let store = checkpoint_store(output, checkpoint_dir);
    let Some(checkpoint) = store
        .load_latest()
        .with_context(|| format!("Failed to read checkpoints in {:?}", store.dir()))?
    else {
        println!("No checkpoints in {:?}", store.dir());
        return Ok(());
    };

    let matched = checkpoint
        .results
        .iter()
        .flatten()
        .filter(|o| o.is_target())
        .count();
    let failed = checkpoint
        .results
        .iter()
        .flatten()
        .filter(|o| o.is_failure())
        .count();
    let accountant = TokenAccountant::restore(
        EngineConfig::default().price_table(),
        checkpoint.usage.clone(),
    );

    println!("Run:        {}", checkpoint.run_id);
    println!("Model:      {}", checkpoint.model);
    println!("Updated:    {}", checkpoint.updated_at.to_rfc3339());
    println!(
        "Progress:   {}/{} ({} recorded)",
        checkpoint.next_index,
        checkpoint.total_candidates,
        checkpoint.recorded()
    );
    println!("Matched:    {}", matched);
    println!("Failed:     {}", failed);
    println!(
        "Tokens:     {} over {} calls",
        accountant.totals().total_tokens,
        accountant.calls()
    );
    println!("Est. cost:  ${:.4}", accountant.estimate_cost().total_cost_usd);
    if checkpoint.is_complete() {
        println!("Complete; rerun to regenerate the result documents.");
    }
    Ok(())
}
