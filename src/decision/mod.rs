//! Decision Agent
//!
//! Precision-weighted bounded drift-diffusion over the combined evidence of
//! the reservoir, reconstruction and novelty scores.
//!
//! Features:
//! - Inputs validated before any state is touched
//! - Episodic priors bias the start point of each accumulation episode
//! - Contracting boundary bounds decision latency even at zero drift
//! - Refractory hold after every decision
//! - Novel vectors handed to episodic memory; storage failures never propagate
//! - Terminal halt when the accumulator or precision stops being finite

pub mod accumulator;
pub mod precision;

pub use accumulator::{Boundary, Label, Step};
pub use precision::{PrecisionState, PrecisionTracker};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::DecisionConfig;
use crate::errors::{InputValidationError, Result, ShunolloError};
use crate::features::FeatureVector;
use crate::memory::{Episode, EpisodicMemory};
use crate::observability::telemetry;

/// Upper clamp of each evidence component.
const COMPONENT_MAX: f64 = 4.0;

/// Everything the agent sees on one tick.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub vector: &'a FeatureVector,
    /// Reservoir readout; `None` while the readout is untrained.
    pub score_r: Option<f64>,
    /// Reconstruction error; `None` while the baseline is untrained.
    pub score_a: Option<f64>,
    pub novelty: f64,
    /// Nearest episodes with their distances, ascending.
    pub priors: &'a [(Episode, f64)],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Accumulating { evidence: f64, ticks: u32 },
    Decided { label: Label, remaining: u32 },
    Halted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub label: Label,
    pub confidence: f64,
    /// Ticks spent accumulating, including the deciding one.
    pub ticks: u32,
    /// Decided by sign at the boundary floor.
    pub forced: bool,
    pub evidence: f64,
    pub precision: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of one agent tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub decision: Option<Decision>,
    pub signal: f64,
    pub prediction_error: f64,
    pub precision: f64,
    pub remembered: bool,
}

pub struct DecisionAgent {
    name: String,
    config: DecisionConfig,
    boundary: Boundary,
    precision: PrecisionTracker,
    state: AgentState,
    rng: StdRng,
    memory: Option<Arc<EpisodicMemory>>,
}

impl DecisionAgent {
    pub fn new(name: impl Into<String>, config: DecisionConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            name: name.into(),
            boundary: Boundary {
                initial: config.threshold,
                decay: config.threshold_decay,
                floor: config.threshold_floor,
            },
            precision: PrecisionTracker::new(&config),
            state: AgentState::Idle,
            rng,
            memory: None,
            config,
        })
    }

    /// Remember novel vectors into `memory`.
    pub fn with_memory(mut self, memory: Arc<EpisodicMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn precision(&self) -> f64 {
        self.precision.precision()
    }

    pub fn precision_state(&self) -> PrecisionState {
        self.precision.state()
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, AgentState::Halted { .. })
    }

    /// Upper bound on ticks in one accumulation episode.
    pub fn max_accumulation_ticks(&self) -> u32 {
        self.boundary.max_ticks()
    }

    /// The only way to reset precision. Also clears a halt.
    pub fn restart(&mut self) {
        info!(agent = %self.name, "Agent restarted");
        self.precision.reset();
        self.state = AgentState::Idle;
    }

    pub fn tick(&mut self, obs: &Observation<'_>) -> Result<TickOutcome> {
        if let AgentState::Halted { reason } = &self.state {
            return Err(ShunolloError::AgentHalted {
                reason: reason.clone(),
            });
        }
        self.validate(obs)?;

        let signal = self.evidence(obs);
        if !signal.is_finite() {
            return Err(self.halt(format!("non-finite evidence signal {signal}")));
        }
        let prediction_error = self.precision.prediction_error(signal);
        let next = self.precision.peek(signal);
        if !next.precision.is_finite() {
            return Err(self.halt(format!("non-finite precision {}", next.precision)));
        }
        self.precision.commit(next);
        let precision = next.precision;

        let decision = match std::mem::replace(&mut self.state, AgentState::Idle) {
            AgentState::Idle => {
                if prediction_error.abs() >= self.config.trigger_error
                    || signal > self.config.criterion
                {
                    let start = self.start_point(obs.priors);
                    debug!(
                        agent = %self.name,
                        signal, prediction_error, start, "Accumulation started"
                    );
                    self.accumulate(start, 0, signal)?
                } else {
                    None
                }
            }
            AgentState::Accumulating { evidence, ticks } => {
                self.accumulate(evidence, ticks, signal)?
            }
            AgentState::Decided { label, remaining } => {
                if remaining > 1 {
                    self.state = AgentState::Decided {
                        label,
                        remaining: remaining - 1,
                    };
                }
                None
            }
            AgentState::Halted { reason } => {
                self.state = AgentState::Halted { reason };
                None
            }
        };

        let remembered = self.consolidate(obs);

        Ok(TickOutcome {
            decision,
            signal,
            prediction_error,
            precision,
            remembered,
        })
    }

    fn validate(&self, obs: &Observation<'_>) -> Result<()> {
        obs.vector.validate(self.config.dimension)?;
        if let Some(r) = obs.score_r {
            if !r.is_finite() {
                return Err(InputValidationError::InvalidScalar {
                    field: "score_r",
                    value: r,
                }
                .into());
            }
        }
        if let Some(a) = obs.score_a {
            check_non_negative("score_a", a)?;
        }
        check_non_negative("novelty", obs.novelty)?;
        for (_, d) in obs.priors {
            check_non_negative("prior distance", *d)?;
        }
        Ok(())
    }

    /// `w_r·r + w_a·a + w_n·n`, each component clamped to `[0, 4]`.
    fn evidence(&self, obs: &Observation<'_>) -> f64 {
        let c = &self.config;
        let r = obs.score_r.map_or(0.0, |v| v.clamp(0.0, COMPONENT_MAX));
        let a = obs
            .score_a
            .map_or(0.0, |v| (v / c.reconstruction_scale).clamp(0.0, COMPONENT_MAX));
        let n = (obs.novelty / c.novelty_threshold).clamp(0.0, COMPONENT_MAX);
        c.weight_reservoir * r + c.weight_reconstruction * a + c.weight_novelty * n
    }

    /// Start biased toward `Normal` by familiar priors and toward `Anomalous`
    /// by unfamiliar ones.
    fn start_point(&self, priors: &[(Episode, f64)]) -> f64 {
        if priors.is_empty() {
            return 0.0;
        }
        let familiar = priors
            .iter()
            .filter(|(_, d)| *d <= self.config.novelty_threshold)
            .count();
        let f = familiar as f64 / priors.len() as f64;
        self.config.start_bias * self.config.threshold * (1.0 - 2.0 * f)
    }

    fn accumulate(&mut self, evidence: f64, ticks: u32, signal: f64) -> Result<Option<Decision>> {
        let weight = self.precision.weight();
        let noise = if self.config.noise_std > 0.0 {
            self.config.noise_std * standard_normal(&mut self.rng)
        } else {
            0.0
        };
        let x = evidence + self.config.drift_gain * weight * (signal - self.config.criterion) + noise;
        let ticks = ticks + 1;
        if !x.is_finite() {
            return Err(self.halt(format!("non-finite accumulator {x} at tick {ticks}")));
        }

        match self.boundary.check(x, ticks) {
            Step::Continue => {
                self.state = AgentState::Accumulating { evidence: x, ticks };
                Ok(None)
            }
            Step::Crossed { label, forced } => {
                let theta = self.boundary.at(ticks);
                let confidence = (x.abs() / theta).min(1.0) * weight;
                telemetry::record_decision(&self.name, label, confidence, ticks);
                self.state = if self.config.refractory_ticks > 0 {
                    AgentState::Decided {
                        label,
                        remaining: self.config.refractory_ticks,
                    }
                } else {
                    AgentState::Idle
                };
                Ok(Some(Decision {
                    label,
                    confidence,
                    ticks,
                    forced,
                    evidence: x,
                    precision: self.precision.precision(),
                    timestamp: Utc::now(),
                }))
            }
        }
    }

    fn consolidate(&self, obs: &Observation<'_>) -> bool {
        if obs.novelty <= self.config.novelty_threshold {
            return false;
        }
        let Some(memory) = &self.memory else {
            return false;
        };
        match memory.remember(obs.vector) {
            Ok(_) => true,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Failed to remember novel vector");
                false
            }
        }
    }

    fn halt(&mut self, reason: String) -> ShunolloError {
        error!(agent = %self.name, %reason, "Agent halted");
        self.state = AgentState::Halted {
            reason: reason.clone(),
        };
        ShunolloError::AgentHalted { reason }
    }
}

impl std::fmt::Debug for DecisionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionAgent")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("precision", &self.precision.precision())
            .finish()
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(InputValidationError::InvalidScalar { field, value }.into())
    }
}

/// Box-Muller draw from `N(0, 1)`.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
