//! Per-agent tick pipeline.
//!
//! Wires one reservoir, one reconstruction scorer and one decision agent to a
//! shared episodic memory. The tick order is fixed: validate, reservoir state
//! update, both scores, recall, novelty, decision.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::Config;
use crate::decision::{Decision, DecisionAgent, Label, Observation, TickOutcome};
use crate::errors::{Result, ShunolloError};
use crate::features::{FeatureExtractor, FeatureVector, WindowDiagnostics, WindowParams};
use crate::memory::EpisodicMemory;
use crate::observability::telemetry;
use crate::reconstruction::ReconstructionScorer;
use crate::reservoir::TemporalReservoir;

/// One decision as emitted to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub label: Label,
    pub confidence: f64,
    pub score_r: Option<f64>,
    pub score_a: Option<f64>,
    pub novelty: f64,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    fn new(decision: &Decision, score_r: Option<f64>, score_a: Option<f64>, novelty: f64) -> Self {
        Self {
            label: decision.label,
            confidence: decision.confidence,
            score_r,
            score_a,
            novelty,
            timestamp: decision.timestamp,
        }
    }
}

/// Everything one tick produced.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub vector_id: uuid::Uuid,
    pub score_r: Option<f64>,
    pub score_a: Option<f64>,
    pub novelty: f64,
    pub outcome: TickOutcome,
    pub record: Option<DecisionRecord>,
    /// Present when the tick extracted the vector itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<WindowDiagnostics>,
}

/// Bounded `(reservoir state, label)` history for readout retraining.
#[derive(Debug, Clone)]
pub struct StateHistory {
    capacity: usize,
    pending: Option<Array1<f64>>,
    samples: VecDeque<(Array1<f64>, f64)>,
}

impl StateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: None,
            samples: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    /// Hold the state of the latest tick until a label arrives.
    pub fn observe(&mut self, state: &Array1<f64>) {
        self.pending = Some(state.clone());
    }

    /// Pair the pending state with `label` (1.0 anomalous, 0.0 normal).
    pub fn label(&mut self, label: Label) {
        if let Some(state) = self.pending.take() {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            let target = match label {
                Label::Anomalous => 1.0,
                Label::Normal => 0.0,
            };
            self.samples.push_back((state, target));
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_vec(&self) -> Vec<(Array1<f64>, f64)> {
        self.samples.iter().cloned().collect()
    }
}

pub struct Pipeline {
    extractor: Option<FeatureExtractor>,
    reservoir: TemporalReservoir,
    scorer: ReconstructionScorer,
    memory: Arc<EpisodicMemory>,
    agent: DecisionAgent,
    recall_k: usize,
    history: Option<StateHistory>,
    ticks: u64,
}

impl Pipeline {
    pub fn new(
        reservoir: TemporalReservoir,
        scorer: ReconstructionScorer,
        memory: Arc<EpisodicMemory>,
        agent: DecisionAgent,
        recall_k: usize,
    ) -> Self {
        Self {
            extractor: None,
            reservoir,
            scorer,
            agent: agent.with_memory(Arc::clone(&memory)),
            memory,
            recall_k,
            history: None,
            ticks: 0,
        }
    }

    /// Build every component from `config` around a shared `memory`.
    pub fn from_config(config: &Config, memory: Arc<EpisodicMemory>, name: &str) -> Result<Self> {
        let reservoir = TemporalReservoir::new(config.reservoir.clone())?;
        let scorer = ReconstructionScorer::new(config.reconstruction.clone())?;
        let agent = DecisionAgent::new(name, config.decision.clone())?;
        let extractor = FeatureExtractor::new(config.extractor.clone())?;
        Ok(Self::new(reservoir, scorer, memory, agent, config.memory.recall_k)
            .with_extractor(extractor))
    }

    pub fn with_extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Record reservoir states against decision labels for readout retraining.
    pub fn with_history(mut self, capacity: usize) -> Self {
        self.history = Some(StateHistory::new(capacity));
        self
    }

    pub fn reservoir(&self) -> &TemporalReservoir {
        &self.reservoir
    }

    pub fn scorer(&self) -> &ReconstructionScorer {
        &self.scorer
    }

    pub fn memory(&self) -> &Arc<EpisodicMemory> {
        &self.memory
    }

    pub fn agent(&self) -> &DecisionAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut DecisionAgent {
        &mut self.agent
    }

    pub fn history(&self) -> Option<&StateHistory> {
        self.history.as_ref()
    }

    /// Extract a fingerprint from raw samples and tick on it.
    pub fn tick_samples(&mut self, samples: &[f64], window: &WindowParams<'_>) -> Result<TickReport> {
        let vector = self.extract(|e| e.extract(samples, window))?;
        let diagnostics = self.extract(|e| e.diagnose(samples, window))?;
        let mut report = self.tick(&vector)?;
        report.diagnostics = Some(diagnostics);
        Ok(report)
    }

    pub fn tick_bytes(&mut self, bytes: &[u8], window: &WindowParams<'_>) -> Result<TickReport> {
        let vector = self.extract(|e| e.extract_bytes(bytes, window))?;
        let diagnostics = self.extract(|e| e.diagnose_bytes(bytes, window))?;
        let mut report = self.tick(&vector)?;
        report.diagnostics = Some(diagnostics);
        Ok(report)
    }

    fn extract<T>(&self, f: impl FnOnce(&FeatureExtractor) -> T) -> Result<T> {
        self.extractor
            .as_ref()
            .map(f)
            .ok_or_else(|| ShunolloError::Config("pipeline has no feature extractor".into()))
    }

    pub fn extractor(&self) -> Option<&FeatureExtractor> {
        self.extractor.as_ref()
    }

    /// Ticks completed without error.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Baseline phase: advance the reservoir and seed memory with exemplars,
    /// without consulting the agent. Exemplars are tagged as known-normal so
    /// consolidation may refit the baseline from them. Returns whether
    /// `vector` was remembered.
    pub fn warm_up(&mut self, vector: &FeatureVector) -> Result<bool> {
        vector.validate(self.memory.dimension())?;
        self.reservoir.advance(vector)?;
        if self.memory.novelty(vector)? > self.agent.config().novelty_threshold {
            self.memory.remember_baseline(vector)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn tick(&mut self, vector: &FeatureVector) -> Result<TickReport> {
        let span = telemetry::tick_span(self.agent.name(), self.ticks + 1);
        let _enter = span.enter();
        vector.validate(self.memory.dimension())?;

        self.reservoir.advance(vector)?;
        let score_r = optional_score(self.reservoir.score())?;
        let score_a = optional_score(self.scorer.score(vector))?;

        let priors = self.memory.recall_similar(vector, self.recall_k)?;
        let novelty = match priors.first() {
            Some((_, d)) => *d,
            None => self.memory.max_novelty(),
        };

        if let Some(history) = self.history.as_mut() {
            history.observe(self.reservoir.state());
        }

        let outcome = self.agent.tick(&Observation {
            vector,
            score_r,
            score_a,
            novelty,
            priors: &priors,
        })?;

        self.ticks += 1;
        if telemetry::should_sample() {
            debug!(
                ?score_r, ?score_a, novelty,
                signal = outcome.signal,
                precision = outcome.precision,
                "Tick"
            );
        }

        let record = outcome
            .decision
            .as_ref()
            .map(|d| DecisionRecord::new(d, score_r, score_a, novelty));
        if let (Some(history), Some(r)) = (self.history.as_mut(), record.as_ref()) {
            history.label(r.label);
        }

        Ok(TickReport {
            vector_id: vector.id,
            score_r,
            score_a,
            novelty,
            outcome,
            record,
            diagnostics: None,
        })
    }

    /// Fit the reconstruction baseline and, when labelled history exists,
    /// the reservoir readout.
    pub fn train(&self, baseline: &[FeatureVector]) -> Result<()> {
        self.scorer.train_baseline(baseline)?;
        if let Some(history) = self.history.as_ref().filter(|h| h.len() >= 2) {
            self.reservoir.train_readout(&history.to_vec())?;
        }
        Ok(())
    }
}

/// An untrained scorer contributes no evidence; every other error propagates.
fn optional_score(result: Result<f64>) -> Result<Option<f64>> {
    match result {
        Ok(score) => Ok(Some(score)),
        Err(ShunolloError::UntrainedModel { model }) => {
            debug!(model, "Scorer not trained yet");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("agent", &self.agent)
            .field("reservoir", &self.reservoir)
            .field("recall_k", &self.recall_k)
            .finish()
    }
}

/// Shared handle that detects concurrent ticks on one pipeline.
///
/// A tick that finds the pipeline busy fails with `ConcurrencyViolation` and
/// poisons the handle. Every later call fails the same way.
#[derive(Clone)]
pub struct SharedPipeline {
    inner: Arc<Mutex<Pipeline>>,
    poisoned: Arc<AtomicBool>,
    name: String,
}

impl SharedPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        let name = pipeline.agent().name().to_string();
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
            poisoned: Arc::new(AtomicBool::new(false)),
            name,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn tick(&self, vector: &FeatureVector) -> Result<TickReport> {
        self.with(|p| p.tick(vector))
    }

    /// Run `f` with exclusive access to the pipeline.
    pub fn with<T>(&self, f: impl FnOnce(&mut Pipeline) -> Result<T>) -> Result<T> {
        if self.is_poisoned() {
            return Err(self.violation());
        }
        let Some(mut guard) = self.inner.try_lock() else {
            self.poisoned.store(true, Ordering::SeqCst);
            error!(agent = %self.name, "Concurrent tick detected; pipeline poisoned");
            return Err(self.violation());
        };
        f(&mut guard)
    }

    fn violation(&self) -> ShunolloError {
        ShunolloError::ConcurrencyViolation {
            agent: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for SharedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPipeline")
            .field("agent", &self.name)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
