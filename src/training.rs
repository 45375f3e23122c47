//! Offline Training
//!
//! Everything that fits a model runs here, away from the tick path.
//! Features:
//! - Cooperative cancellation via [`CancelToken`]
//! - Work runs on the blocking thread pool
//! - Results are published by an atomic `Arc` swap on completion only
//! - Periodic consolidation windows with a shutdown signal

use ndarray::Array1;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConsolidationConfig, ReconstructionConfig};
use crate::errors::{Result, ShunolloError, TrainingError};
use crate::features::FeatureVector;
use crate::memory::consolidation::{self, ConsolidationReport};
use crate::memory::{Episode, EpisodicMemory};
use crate::observability::telemetry;
use crate::reconstruction::BaselineModel;
use crate::reservoir::Readout;

/// Shared cancellation flag checked by long-running fits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> std::result::Result<(), TrainingError> {
        if self.is_cancelled() {
            Err(TrainingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Atomically replaceable model snapshot.
///
/// Readers clone the inner `Arc` and keep serving from it even while a new
/// model is being stored.
pub struct ModelSlot<T> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> ModelSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn store(&self, model: T) {
        self.store_arc(Arc::new(model));
    }

    pub fn store_arc(&self, model: Arc<T>) {
        *self.inner.write() = Some(model);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl<T> Clone for ModelSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ModelSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ModelSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Baseline target for a consolidation refit.
#[derive(Debug, Clone)]
pub struct BaselineTarget {
    pub slot: ModelSlot<BaselineModel>,
    pub config: ReconstructionConfig,
}

/// Runs fits on the blocking pool and swaps their results in.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    cancel: CancelToken,
}

impl Trainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fit a reconstruction baseline and install it into `target.slot`.
    pub async fn train_baseline(
        &self,
        target: BaselineTarget,
        batch: Vec<FeatureVector>,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        let config = target.config.clone();
        telemetry::track_training("baseline", || async move {
            let model = run_blocking(move || BaselineModel::fit(&batch, &config, &cancel)).await?;
            self.publish(&target.slot, model)?;
            info!("Reconstruction baseline swapped in");
            Ok::<(), ShunolloError>(())
        })
        .await
    }

    /// Refit the reservoir readout from `(state, label)` history.
    pub async fn retrain_readout(
        &self,
        slot: ModelSlot<Readout>,
        hidden_size: usize,
        ridge: f64,
        history: Vec<(Array1<f64>, f64)>,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        let samples = history.len();
        telemetry::track_training("readout", || async move {
            let readout =
                run_blocking(move || Readout::fit(&history, hidden_size, ridge, &cancel)).await?;
            self.publish(&slot, readout)?;
            info!(samples, "Reservoir readout swapped in");
            Ok::<(), ShunolloError>(())
        })
        .await
    }

    /// One consolidation window over a snapshot of `memory`. With
    /// `refit_baseline` set, the reconstruction baseline is refit from the
    /// known-normal exemplars only, consolidated in a graph of their own so
    /// novel episodes cannot pull them towards themselves.
    pub async fn consolidate(
        &self,
        memory: Arc<EpisodicMemory>,
        config: ConsolidationConfig,
        baseline: Option<BaselineTarget>,
    ) -> Result<ConsolidationReport> {
        let episodes = memory.snapshot();
        if episodes.len() < 2 {
            return Err(TrainingError::InsufficientData {
                needed: 2,
                got: episodes.len(),
            }
            .into());
        }

        let cancel = self.cancel.clone();
        let refit = baseline
            .as_ref()
            .filter(|_| config.refit_baseline)
            .map(|t| t.config.clone());
        let (report, model, exemplars) = run_blocking(move || {
            let report = consolidation::consolidate(&episodes, &config, &cancel)?;
            let exemplars: Vec<Episode> = episodes.into_iter().filter(|ep| ep.baseline).collect();
            let model = match refit {
                Some(rc) if exemplars.len() > rc.bottleneck => {
                    let refined = consolidation::consolidate(&exemplars, &config, &cancel)?.refined;
                    Some(BaselineModel::fit(&refined, &rc, &cancel)?)
                }
                Some(rc) => {
                    debug!(
                        exemplars = exemplars.len(),
                        bottleneck = rc.bottleneck,
                        "Too few baseline exemplars to refit"
                    );
                    None
                }
                None => None,
            };
            Ok((report, model, exemplars.len()))
        })
        .await?;

        if let (Some(target), Some(model)) = (baseline, model) {
            self.publish(&target.slot, model)?;
            info!(exemplars, "Baseline refit from consolidated exemplars");
        }
        Ok(report)
    }

    fn publish<T>(&self, slot: &ModelSlot<T>, model: T) -> Result<()> {
        // A cancel that lands after the fit still discards the result.
        self.cancel.check()?;
        slot.store(model);
        Ok(())
    }
}

/// At most one detached training task at a time.
///
/// The tick loop hands work over with [`BackgroundJob::try_spawn`] and keeps
/// going; a new job is refused while the previous one is still running.
#[derive(Debug, Default)]
pub struct BackgroundJob {
    name: &'static str,
    handle: Option<JoinHandle<Result<()>>>,
}

impl BackgroundJob {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn `job` unless one is still in flight. Returns whether it started.
    /// The outcome of a finished predecessor is logged and dropped.
    pub async fn try_spawn<F>(&mut self, job: F) -> bool
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_running() {
            debug!(job = self.name, "Previous job still running, skipping");
            return false;
        }
        // The predecessor has finished, so this resolves immediately.
        if let Err(e) = self.join().await {
            warn!(job = self.name, error = %e, "Background job failed");
        }
        self.handle = Some(tokio::spawn(job));
        true
    }

    /// Wait for the job in flight, if any, and return its outcome.
    pub async fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| ShunolloError::from(TrainingError::Join(e.to_string())))?,
            None => Ok(()),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShunolloError::from(TrainingError::Join(e.to_string())))?
}

/// Periodic offline consolidation.
pub struct ConsolidationScheduler {
    memory: Arc<EpisodicMemory>,
    config: ConsolidationConfig,
    baseline: Option<BaselineTarget>,
    trainer: Trainer,
}

impl ConsolidationScheduler {
    pub fn new(memory: Arc<EpisodicMemory>, config: ConsolidationConfig) -> Self {
        Self {
            memory,
            config,
            baseline: None,
            trainer: Trainer::new(),
        }
    }

    pub fn with_baseline(mut self, target: BaselineTarget) -> Self {
        self.baseline = Some(target);
        self
    }

    /// Run windows every `interval_secs` until `shutdown` flips to `true` or
    /// its sender is dropped. Resolves to the number of completed windows.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.interval_secs);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut completed = 0usize;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self
                            .trainer
                            .consolidate(
                                Arc::clone(&self.memory),
                                self.config.clone(),
                                self.baseline.clone(),
                            )
                            .await
                        {
                            Ok(report) => {
                                completed += 1;
                                info!(
                                    window = completed,
                                    energy_before = report.energy_before,
                                    energy_after = report.energy_after,
                                    "Consolidation window complete"
                                );
                            }
                            Err(ShunolloError::Training(TrainingError::InsufficientData { got, .. })) => {
                                debug!(episodes = got, "Skipping consolidation window");
                            }
                            Err(e) => warn!(error = %e, "Consolidation window failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.trainer.cancel_token().cancel();
                            break;
                        }
                    }
                }
            }
            completed
        })
    }
}
