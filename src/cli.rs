//! shunollo command line
//!
//! JSON-lines windows in, JSON-lines decision records out.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{ShunolloError, TrainingError};
use crate::features::{FeatureVector, WindowDiagnostics, WindowParams};
use crate::memory::EpisodicMemory;
use crate::observability::telemetry::{self, init_tracing, LogFormat};
use crate::pipeline::{Pipeline, StateHistory};
use crate::reservoir::TemporalReservoir;
use crate::training::{BackgroundJob, BaselineTarget, ConsolidationScheduler, Trainer};

#[derive(Parser)]
#[command(name = "shunollo")]
#[command(about = "Signal fingerprinting and drift-diffusion anomaly decisions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Verbose logging on stderr (overrides RUST_LOG)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact", global = true)]
    log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum LogFormatArg {
    #[default]
    Compact,
    Json,
}

/// Output format for `check-config`
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// TOML, loadable with `--config` (default)
    #[default]
    Toml,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a stream of windows and emit decisions
    #[command(alias = "r")]
    Run {
        /// JSON-lines window file (stdin when omitted)
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Destination for decision records (stdout when omitted)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Treat the first N windows as the baseline phase
        #[arg(short, long, default_value = "0")]
        baseline: usize,

        /// Agent name used in logs
        #[arg(long, default_value = "agent-0")]
        agent: String,

        /// Emit a report for every tick, not just decisions
        #[arg(long)]
        all: bool,

        /// Retrain the reservoir readout every N ticks from decided history (0 disables)
        #[arg(long, default_value = "0")]
        retrain_every: u64,

        /// Run periodic consolidation windows in the background
        #[arg(long)]
        consolidate: bool,

        /// Abort on the first malformed window instead of skipping it
        #[arg(long)]
        strict: bool,
    },

    /// Validate and print the effective configuration
    CheckConfig {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },

    /// Show what an episode log contains
    InspectMemory {
        /// Episode log (defaults to memory.log_path)
        #[arg(value_name = "FILE")]
        path: Option<PathBuf>,

        /// Also print the N most recent episodes
        #[arg(short, long)]
        recent: Option<usize>,
    },
}

/// One input line of `shunollo run`.
///
/// Exactly one of `samples`, `bytes` or `vector` must be present.
#[derive(Debug, Deserialize)]
struct WindowRecord {
    #[serde(default)]
    samples: Option<Vec<f64>>,
    #[serde(default)]
    bytes: Option<Vec<u8>>,
    /// A precomputed fingerprint.
    #[serde(default)]
    vector: Option<Vec<f64>>,
    #[serde(default = "default_duration")]
    duration_secs: f64,
    #[serde(default)]
    arrival_times: Option<Vec<f64>>,
    #[serde(default)]
    latency_ms: f64,
    #[serde(default)]
    queue_depth: f64,
    #[serde(default)]
    error_rate: f64,
    #[serde(default = "default_true")]
    protocol_valid: bool,
    #[serde(default = "default_true")]
    port_standard: bool,
    #[serde(default)]
    expected_high_entropy: bool,
}

fn default_duration() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl WindowRecord {
    fn params(&self) -> WindowParams<'_> {
        WindowParams {
            duration_secs: self.duration_secs,
            arrival_times: self.arrival_times.as_deref(),
            latency_ms: self.latency_ms,
            queue_depth: self.queue_depth,
            error_rate: self.error_rate,
            protocol_valid: self.protocol_valid,
            port_standard: self.port_standard,
            expected_high_entropy: self.expected_high_entropy,
        }
    }

    /// Fingerprint of this window.
    fn fingerprint(&self, pipeline: &Pipeline) -> Result<FeatureVector> {
        if let Some(values) = &self.vector {
            return FeatureVector::new(values.clone()).map_err(|e| ShunolloError::from(e).into());
        }
        let extractor = pipeline
            .extractor()
            .context("Pipeline was built without an extractor")?;
        let params = self.params();
        match (&self.samples, &self.bytes) {
            (Some(samples), None) => Ok(extractor.extract(samples, &params)),
            (None, Some(bytes)) => Ok(extractor.extract_bytes(bytes, &params)),
            _ => anyhow::bail!("window must carry exactly one of samples, bytes or vector"),
        }
    }

    /// Health statistics of a raw window. Ready vectors carry none.
    fn diagnostics(&self, pipeline: &Pipeline) -> Option<WindowDiagnostics> {
        let extractor = pipeline.extractor()?;
        let params = self.params();
        match (&self.samples, &self.bytes) {
            (Some(samples), None) => Some(extractor.diagnose(samples, &params)),
            (None, Some(bytes)) => Some(extractor.diagnose_bytes(bytes, &params)),
            _ => None,
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let format = match cli.log_format {
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    if cli.verbose {
        telemetry::init_tracing_with_format("shunollo=debug", format);
    } else if let Ok(filter) = std::env::var("RUST_LOG") {
        telemetry::init_tracing_with_format(&filter, format);
    } else {
        init_tracing();
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            output,
            baseline,
            agent,
            all,
            retrain_every,
            consolidate,
            strict,
        } => {
            let opts = RunOptions {
                input,
                output,
                baseline,
                agent,
                all,
                retrain_every,
                consolidate,
                strict,
            };
            run_stream(config, opts).await
        }
        Commands::CheckConfig { format } => {
            let rendered = match format {
                OutputFormat::Toml => {
                    toml::to_string_pretty(&config).context("Failed to render config")?
                }
                OutputFormat::Json => {
                    serde_json::to_string_pretty(&config).context("Failed to render config")?
                }
            };
            println!("{}", rendered);
            Ok(())
        }
        Commands::InspectMemory { path, recent } => inspect_memory(config, path, recent),
    }
}

struct RunOptions {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    baseline: usize,
    agent: String,
    all: bool,
    retrain_every: u64,
    consolidate: bool,
    strict: bool,
}

async fn run_stream(config: Config, opts: RunOptions) -> Result<()> {
    let memory = Arc::new(
        EpisodicMemory::from_config(&config.memory).context("Failed to open episodic memory")?,
    );
    info!(episodes = memory.len(), "Episodic memory loaded");

    let mut pipeline = Pipeline::from_config(&config, Arc::clone(&memory), &opts.agent)?;
    if opts.retrain_every > 0 {
        pipeline = pipeline.with_history(HISTORY_CAPACITY);
    }

    let baseline_target = BaselineTarget {
        slot: pipeline.scorer().model_slot(),
        config: config.reconstruction.clone(),
    };
    let trainer = Trainer::new();
    let mut baseline_job = BackgroundJob::new("baseline");
    let mut readout_job = BackgroundJob::new("readout");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = opts.consolidate.then(|| {
        ConsolidationScheduler::new(Arc::clone(&memory), config.consolidation.clone())
            .with_baseline(baseline_target.clone())
            .spawn(shutdown_rx)
    });

    let reader: Box<dyn BufRead> = match &opts.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let mut writer: Box<dyn Write> = match &opts.output {
        Some(path) => Box::new(BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };

    let mut baseline_batch = Vec::with_capacity(opts.baseline);
    let mut skipped = 0usize;
    let mut decisions = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        if crate::is_shutdown_requested() {
            info!("Shutdown requested, stopping input");
            break;
        }
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        let (vector, diagnostics) = match read_window(&line, &pipeline, opts.all) {
            Ok(v) => v,
            Err(e) if !opts.strict => {
                warn!(line = line_no + 1, error = %e, "Skipping malformed window");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.context(format!("Malformed window on line {}", line_no + 1))),
        };

        if baseline_batch.len() < opts.baseline {
            pipeline.warm_up(&vector)?;
            baseline_batch.push(vector);
            if baseline_batch.len() == opts.baseline {
                let trainer = trainer.clone();
                let target = baseline_target.clone();
                let batch = baseline_batch.clone();
                baseline_job
                    .try_spawn(async move { trainer.train_baseline(target, batch).await })
                    .await;
            }
            continue;
        }

        let mut report = match pipeline.tick(&vector) {
            Ok(report) => report,
            Err(ShunolloError::InputValidation(e)) if !opts.strict => {
                warn!(line = line_no + 1, error = %e, "Rejected window");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        report.diagnostics = diagnostics;
        if let Some(record) = &report.record {
            decisions += 1;
            if !opts.all {
                serde_json::to_writer(&mut writer, record)?;
                writeln!(writer)?;
            }
        }
        if opts.all {
            serde_json::to_writer(&mut writer, &report)?;
            writeln!(writer)?;
        }

        if opts.retrain_every > 0 && pipeline.ticks() % opts.retrain_every == 0 {
            if let Some(history) = pipeline.history() {
                spawn_readout_retrain(&mut readout_job, &trainer, pipeline.reservoir(), history)
                    .await;
            }
        }
    }

    writer.flush().context("Failed to flush output")?;
    if baseline_batch.len() < opts.baseline {
        warn!(
            windows = baseline_batch.len(),
            wanted = opts.baseline,
            "Input ended during the baseline phase; reconstruction scorer left untrained"
        );
    }
    if crate::is_shutdown_requested() {
        trainer.cancel_token().cancel();
    }
    match readout_job.join().await {
        Ok(()) => {}
        Err(ShunolloError::Training(TrainingError::Cancelled)) => {
            debug!("Readout retraining cancelled")
        }
        Err(e) => warn!(error = %e, "Readout retraining failed"),
    }
    match baseline_job.join().await {
        Ok(()) => {}
        Err(ShunolloError::Training(TrainingError::Cancelled)) => {
            info!("Baseline training cancelled at shutdown")
        }
        Err(e) => return Err(anyhow::Error::from(e).context("Baseline training failed")),
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        let windows = handle.await.context("Consolidation task panicked")?;
        info!(windows, "Consolidation stopped");
    }
    memory.flush().context("Failed to flush episodic memory")?;

    info!(
        ticks = pipeline.ticks(),
        decisions,
        skipped,
        episodes = memory.len(),
        "Stream finished"
    );
    Ok(())
}

/// Samples kept for readout retraining.
const HISTORY_CAPACITY: usize = 4096;

fn parse_window(line: &str, pipeline: &Pipeline) -> Result<FeatureVector> {
    read_window(line, pipeline, false).map(|(vector, _)| vector)
}

fn read_window(
    line: &str,
    pipeline: &Pipeline,
    diagnose: bool,
) -> Result<(FeatureVector, Option<WindowDiagnostics>)> {
    let record: WindowRecord = serde_json::from_str(line).context("Invalid window JSON")?;
    let vector = record.fingerprint(pipeline)?;
    let diagnostics = if diagnose {
        record.diagnostics(pipeline)
    } else {
        None
    };
    Ok((vector, diagnostics))
}

/// Hand a readout refit to the background so the tick loop keeps going.
/// At most one refit runs at a time; returns whether one was started.
async fn spawn_readout_retrain(
    job: &mut BackgroundJob,
    trainer: &Trainer,
    reservoir: &TemporalReservoir,
    history: &StateHistory,
) -> bool {
    if job.is_running() {
        debug!("Readout retraining still running, skipping");
        return false;
    }
    if history.len() < 2 {
        return false;
    }
    let trainer = trainer.clone();
    let slot = reservoir.readout_slot();
    let hidden_size = reservoir.hidden_size();
    let ridge = reservoir.config().ridge;
    let history = history.to_vec();
    job.try_spawn(async move {
        trainer
            .retrain_readout(slot, hidden_size, ridge, history)
            .await
    })
    .await
}

fn inspect_memory(mut config: Config, path: Option<PathBuf>, recent: Option<usize>) -> Result<()> {
    if let Some(path) = path {
        config.memory.log_path = Some(path);
    }
    let log_path = config
        .memory
        .log_path
        .clone()
        .context("No episode log given and memory.log_path is unset")?;
    config.memory.write_behind = false;

    let memory = EpisodicMemory::from_config(&config.memory)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;
    println!("{}", serde_json::to_string_pretty(&memory.stats())?);

    if let Some(n) = recent {
        let mut episodes = memory.snapshot();
        episodes.sort_by_key(|ep| ep.recorded_at);
        let start = episodes.len().saturating_sub(n);
        for ep in &episodes[start..] {
            println!("{}", serde_json::to_string(ep)?);
        }
    }
    Ok(())
}
