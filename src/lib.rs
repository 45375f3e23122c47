//! Shunollo - Signal Fingerprint Anomaly Core
//!
//! Turns arbitrary numeric or byte streams into fixed-size signal
//! fingerprints and decides, tick by tick, whether the stream has become
//! anomalous.
//!
//! - **Features**: Psychophysical fingerprint extraction into `[0, 1]^16`
//! - **Memory**: Append-only episode log with nearest-neighbour recall
//! - **Reservoir**: Echo-state recurrent scorer with a ridge readout
//! - **Reconstruction**: Linear bottleneck baseline and reconstruction error
//! - **Decision**: Precision-weighted drift-diffusion with a contracting bound
//! - **Training**: Cancellable background fits and offline consolidation
//!
//! # Quick Start
//!
//! ```ignore
//! use shunollo::{Config, EpisodicMemory, Pipeline};
//! use std::sync::Arc;
//!
//! let config = Config::load(None)?;
//! let memory = Arc::new(EpisodicMemory::from_config(&config.memory)?);
//! let mut pipeline = Pipeline::from_config(&config, memory, "agent-0")?;
//! let report = pipeline.tick_samples(&samples, &Default::default())?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

// ─── Core modules ──────────────────────────────────────────────────
pub mod config;
pub mod errors;
pub mod linalg;

// ─── Pipeline stages ───────────────────────────────────────────────
pub mod decision;
pub mod features;
pub mod memory;
pub mod reconstruction;
pub mod reservoir;

// ─── Wiring & Offline Work ─────────────────────────────────────────
pub mod pipeline;
pub mod training;

// ─── Infrastructure ────────────────────────────────────────────────
pub mod cli;
pub mod observability;

pub use config::Config;
pub use decision::{Decision, DecisionAgent, Label};
pub use errors::{Result, ShunolloError};
pub use features::{FeatureExtractor, FeatureVector, WindowParams, FEATURE_DIM};
pub use memory::{Episode, EpisodicMemory};
pub use pipeline::{DecisionRecord, Pipeline, SharedPipeline};
pub use reconstruction::ReconstructionScorer;
pub use reservoir::TemporalReservoir;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Ask long-running loops to wind down.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn is_shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
