//! Telemetry & Observability
//!
//! Structured logging and tracing for the tick loop and background training.
//! Features:
//! - Configurable log levels via RUST_LOG
//! - Compact or JSON output on stderr
//! - Training spans with timing and outcome
//! - Configurable sampling rate for per-tick events

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Instant;
use tracing::{debug, error, info, info_span, Instrument, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::decision::Label;

/// Sampling rate for per-tick events as fixed point (rate * 1_000_000).
static SAMPLING_RATE_MICRO: AtomicU64 = AtomicU64::new(1_000_000);

static SAMPLE_COUNTER: AtomicU64 = AtomicU64::new(0);

static INIT: Once = Once::new();

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Set the per-tick sampling rate. `rate` is clamped to `0.0..=1.0`.
pub fn set_sampling_rate(rate: f64) {
    let clamped = rate.clamp(0.0, 1.0);
    SAMPLING_RATE_MICRO.store((clamped * 1_000_000.0) as u64, Ordering::Relaxed);
}

pub fn sampling_rate() -> f64 {
    SAMPLING_RATE_MICRO.load(Ordering::Relaxed) as f64 / 1_000_000.0
}

/// Whether the next per-tick event should be emitted. Decisions and errors
/// are never sampled.
pub fn should_sample() -> bool {
    let rate_micro = SAMPLING_RATE_MICRO.load(Ordering::Relaxed);
    if rate_micro >= 1_000_000 {
        return true;
    }
    if rate_micro == 0 {
        return false;
    }
    let count = SAMPLE_COUNTER.fetch_add(1, Ordering::Relaxed);
    (count % 1_000_000) < rate_micro
}

/// Escape control characters so user-supplied names cannot forge log lines.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Initialize the global subscriber only when RUST_LOG is set, keeping
/// stdout and stderr quiet for pipelines otherwise.
pub fn init_tracing() {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        init_tracing_with_filter(&filter);
    }
}

pub fn init_tracing_with_filter(filter: &str) {
    init_tracing_with_format(filter, LogFormat::Compact);
}

/// Initialize with a filter string and output format. Later calls are no-ops.
pub fn init_tracing_with_format(filter: &str, format: LogFormat) {
    let filter = filter.to_string();
    INIT.call_once(move || {
        let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter_layer);

        // Records go to stdout; logs always go to stderr.
        let _ = match format {
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_level(true)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
    });
}

/// Flush buffered log output before the process exits.
pub fn shutdown_tracing() {
    let _ = std::io::stderr().flush();
}

/// Span for one tick of a named agent.
pub fn tick_span(agent: &str, tick: u64) -> Span {
    let safe_agent = sanitize_for_log(agent);
    info_span!("agent.tick", agent = safe_agent.as_str(), tick = tick)
}

/// Log a decision. Decisions bypass sampling.
pub fn record_decision(agent: &str, label: Label, confidence: f64, ticks: u32) {
    let safe_agent = sanitize_for_log(agent);
    info!(
        agent = safe_agent.as_str(),
        %label,
        confidence,
        ticks,
        "Decision"
    );
}

/// Run a training job inside a span that records its duration and outcome.
pub async fn track_training<F, Fut, T, E>(job: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let span = info_span!(
        "training.job",
        job = job,
        duration_ms = tracing::field::Empty,
        success = tracing::field::Empty,
    );
    span.in_scope(|| debug!("Training job started"));

    let result = f().instrument(span.clone()).await;
    let duration = start.elapsed().as_millis() as u64;
    span.record("duration_ms", duration);
    span.in_scope(|| match &result {
        Ok(_) => {
            span.record("success", true);
            info!(duration_ms = duration, "Training job completed");
        }
        Err(e) => {
            span.record("success", false);
            error!(duration_ms = duration, error = %e, "Training job failed");
        }
    });
    result
}

/// Initialize tracing for tests with a simple subscriber
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
