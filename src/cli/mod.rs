//! Command-line interface for verifact.
//!
//! Provides commands for checking text, listing recorded runs, replaying a
//! run's events and showing the resolved configuration.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use uuid::Uuid;

use crate::agents::create_default_pipeline;
use crate::config;
use crate::core::{logging_observer, EventLog};
use crate::domain::{EventKind, PipelineRun, RunState, Stage};

/// verifact - Resilient fact-check pipeline
#[derive(Parser, Debug)]
#[command(name = "verifact")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fact-check a piece of text
    Check {
        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print each verdict as soon as it is written
        #[arg(long)]
        stream: bool,

        /// Drop claims scoring below this
        #[arg(long)]
        min_score: Option<f64>,

        /// Check at most this many claims
        #[arg(long)]
        max_claims: Option<usize>,
    },

    /// List recorded runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the events of a run
    Events {
        /// Run ID (UUID)
        run_id: String,

        /// Only show events of this kind (e.g. error, warning)
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Check {
                input,
                stream,
                min_score,
                max_claims,
            } => check(input, stream, min_score, max_claims).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Events { run_id, kind } => show_events(&run_id, kind.as_deref()).await,
            Commands::Config => show_config(),
        }
    }
}

fn read_input(input_file: Option<PathBuf>) -> Result<String> {
    let input = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    if input.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }
    Ok(input)
}

/// Fact-check the input and print verdicts as JSON
async fn check(
    input_file: Option<PathBuf>,
    stream: bool,
    min_score: Option<f64>,
    max_claims: Option<usize>,
) -> Result<()> {
    let input = read_input(input_file)?;

    let mut cfg = config::config()?.clone();
    if let Some(min) = min_score {
        cfg.pipeline.min_check_worthiness = min;
    }
    if max_claims.is_some() {
        cfg.pipeline.max_claims = max_claims;
    }

    let orchestrator = create_default_pipeline(&cfg)?;
    orchestrator.register_observer(logging_observer());
    let (writer, persisted) = EventLog::writer(cfg.runs_dir());
    let writer_id = orchestrator.register_observer(writer);

    let result = if stream {
        let mut verdicts = orchestrator.process_streaming(input);
        while let Some(verdict) = verdicts.next().await {
            println!("{}", serde_json::to_string(&verdict)?);
        }
        verdicts.finish().await
    } else {
        let result = orchestrator.run(&input).await;
        if let Ok(ref run) = result {
            println!("{}", serde_json::to_string_pretty(&run.verdicts)?);
        }
        result
    };

    // Dropping the last observer handle lets the writer drain and stop
    orchestrator.unregister_observer(writer_id);
    let written = persisted.await.context("Event log writer failed")?;

    let run = result?;
    report(&run, written);
    Ok(())
}

fn report(run: &PipelineRun, events_written: usize) {
    let stats = &run.stats;
    eprintln!(
        "\n[Run {}: {} claims checked, {} verdicts, {} errors, {} warnings, {} events logged]",
        run.id,
        stats.claims_checked,
        stats.verdicts_generated,
        stats.errors,
        stats.warnings,
        events_written
    );
    match &run.state {
        RunState::Complete => {}
        RunState::Error { error } if run.timed_out => {
            eprintln!("[Run {} timed out, results are partial: {}]", run.id, error)
        }
        RunState::Error { error } => eprintln!("[Run {} ended early: {}]", run.id, error),
        other => eprintln!("[Run {} in state: {:?}]", run.id, other),
    }
}

/// List recorded runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs = EventLog::list_runs().await?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    let mut rows = Vec::with_capacity(runs.len());
    for run_id in runs {
        let log = EventLog::open(run_id).await?;
        let events = log.replay().await?;
        let started = events.first().map(|e| e.timestamp);
        let state = if events.iter().any(|e| e.kind == EventKind::Completed) {
            "complete"
        } else if events.is_empty() {
            "empty"
        } else {
            "incomplete"
        };
        let verdicts = events
            .iter()
            .filter(|e| e.kind == EventKind::ItemCompleted && e.stage == Stage::Verdict)
            .count();
        rows.push((run_id, started, state, verdicts));
    }
    rows.sort_by(|a, b| b.1.cmp(&a.1));

    println!("{:<38} {:<22} {:<12} {:<8}", "RUN ID", "STARTED", "STATE", "VERDICTS");
    println!("{}", "-".repeat(82));
    for (run_id, started, state, verdicts) in rows.into_iter().take(limit) {
        let started = started
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:<22} {:<12} {:<8}", run_id, started, state, verdicts);
    }

    Ok(())
}

/// Print the events of one run
async fn show_events(run_id_str: &str, kind: Option<&str>) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;
    let kind: Option<EventKind> = kind
        .map(|k| serde_json::from_value(serde_json::Value::String(k.to_string())))
        .transpose()
        .with_context(|| format!("Unknown event kind: {}", kind.unwrap_or_default()))?;

    if !EventLog::base_directory()?.join(run_id.to_string()).exists() {
        anyhow::bail!("Run not found: {}", run_id);
    }
    let log = EventLog::open(run_id).await?;
    let events = log.replay().await?;
    if events.is_empty() {
        anyhow::bail!("No events recorded for run {}", run_id);
    }

    for event in events.iter().filter(|e| kind.map_or(true, |k| e.kind == k)) {
        println!(
            "{:>4} {} {:<16} {:<10} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", event.kind),
            event.stage.as_str(),
            event.payload
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("verifact configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Runs:     {}", cfg.runs_dir().display());
    println!("  Cache DB: {}", cfg.cache_db().display());
    println!();
    println!("Models ({}):", cfg.models.endpoint);
    for role in [
        crate::agents::AgentRole::ClaimDetector,
        crate::agents::AgentRole::EvidenceHunter,
        crate::agents::AgentRole::VerdictWriter,
    ] {
        println!("  {:<16} {}", role.as_str(), cfg.models.chain_for(role).join(" -> "));
    }
    println!(
        "  API key:         ${} ({})",
        cfg.models.api_key_env,
        if std::env::var(&cfg.models.api_key_env).is_ok() { "set" } else { "missing" }
    );
    println!();
    println!("Cache:");
    println!("  Enabled:     {}", cfg.cache.enabled);
    println!("  Backend:     {:?}", cfg.cache.backend);
    println!("  Default TTL: {}s", cfg.cache.default_ttl_seconds);
    println!();
    println!("Rate limit:");
    println!("  Enabled: {}", cfg.rate_limit.enabled);
    println!("  Window:  {}s", cfg.rate_limit.window_seconds);
    println!("  Default: {} requests", cfg.rate_limit.default_limit);
    println!();
    println!("Pipeline:");
    println!("  Min check-worthiness: {}", cfg.pipeline.min_check_worthiness);
    println!(
        "  Max claims:           {}",
        cfg.pipeline.max_claims.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
    );
    println!("  Max concurrent:       {}", cfg.pipeline.max_concurrent);
    println!("  Retry attempts:       {}", cfg.pipeline.retry_attempts);
    println!("  Timeout:              {}s", cfg.pipeline.timeout_seconds);
    println!("  Raise on error:       {}", cfg.pipeline.raise_on_error);

    Ok(())
}
