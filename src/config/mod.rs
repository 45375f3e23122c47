//! Configuration Management
//!
//! Loads pipeline configuration from TOML files.
//! Configuration includes:
//! - Extractor spans and baselines (every ratio has a declared maximum)
//! - Episodic memory dimension, recall depth and backing log
//! - Reservoir geometry, readout ridge and seed
//! - Reconstruction bottleneck size
//! - Decision thresholds, precision smoothing and evidence weights
//! - Offline consolidation schedule

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ShunolloError;
use crate::features::FEATURE_DIM;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub reservoir: ReservoirConfig,

    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    #[serde(default)]
    pub decision: DecisionConfig,

    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

/// Declared spans used to make every extracted quantity dimensionless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default)]
    pub value_min: f64,
    #[serde(default = "default_value_max")]
    pub value_max: f64,
    #[serde(default = "default_rate_max_hz")]
    pub rate_max_hz: f64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: f64,
    /// Variance of first differences that saturates flux.
    #[serde(default = "default_flux_limit")]
    pub flux_limit: f64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: f64,
    #[serde(default = "default_pressure_max")]
    pub pressure_max: f64,
    /// Exponent `p` of `energy = size · rate^p`; must exceed 1.
    #[serde(default = "default_energy_exponent")]
    pub energy_exponent: f64,
    #[serde(default = "default_entropy_bins")]
    pub entropy_bins: usize,
    /// Expected mean level for the volatility index.
    #[serde(default)]
    pub baseline_mean: f64,
    #[serde(default = "default_baseline_sigma")]
    pub baseline_sigma: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            value_min: 0.0,
            value_max: default_value_max(),
            rate_max_hz: default_rate_max_hz(),
            jitter_max_secs: default_jitter_max_secs(),
            flux_limit: default_flux_limit(),
            delay_max_ms: default_delay_max_ms(),
            pressure_max: default_pressure_max(),
            energy_exponent: default_energy_exponent(),
            entropy_bins: default_entropy_bins(),
            baseline_mean: 0.0,
            baseline_sigma: default_baseline_sigma(),
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if !(self.value_max > self.value_min)
            || !self.value_min.is_finite()
            || !self.value_max.is_finite()
        {
            return Err(config_error(format!(
                "extractor.value_max ({}) must exceed extractor.value_min ({})",
                self.value_max, self.value_min
            )));
        }
        require_positive("extractor.rate_max_hz", self.rate_max_hz)?;
        require_positive("extractor.jitter_max_secs", self.jitter_max_secs)?;
        require_positive("extractor.flux_limit", self.flux_limit)?;
        require_positive("extractor.delay_max_ms", self.delay_max_ms)?;
        require_positive("extractor.pressure_max", self.pressure_max)?;
        require_positive("extractor.baseline_sigma", self.baseline_sigma)?;
        if !(self.energy_exponent > 1.0) || !self.energy_exponent.is_finite() {
            return Err(config_error(format!(
                "extractor.energy_exponent must be > 1, got {}",
                self.energy_exponent
            )));
        }
        if self.entropy_bins < 2 {
            return Err(config_error("extractor.entropy_bins must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.baseline_mean) {
            return Err(config_error("extractor.baseline_mean must lie in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Number of priors recalled per tick.
    #[serde(default = "default_recall_k")]
    pub recall_k: usize,
    /// JSONL episode log; `None` keeps memory in-process only.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Hand log appends to a background writer thread so the tick path
    /// never waits on disk. Only read-only tools turn this off.
    #[serde(default = "default_true")]
    pub write_behind: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            recall_k: default_recall_k(),
            log_path: None,
            write_behind: true,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.dimension == 0 {
            return Err(config_error("memory.dimension must be positive"));
        }
        if self.recall_k == 0 {
            return Err(config_error("memory.recall_k must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    #[serde(default = "default_dimension")]
    pub input_dimension: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Target spectral radius of the recurrent matrix, in `(0, 1)`.
    #[serde(default = "default_spectral_radius")]
    pub spectral_radius: f64,
    /// Fraction of non-zero recurrent connections.
    #[serde(default = "default_connectivity")]
    pub connectivity: f64,
    #[serde(default = "default_input_scaling")]
    pub input_scaling: f64,
    #[serde(default = "default_leak_rate")]
    pub leak_rate: f64,
    /// Ridge regularization of the readout regression.
    #[serde(default = "default_ridge")]
    pub ridge: f64,
    #[serde(default = "default_reservoir_seed")]
    pub seed: u64,
    /// Iterations of the spectral radius growth-rate estimate.
    #[serde(default = "default_radius_iterations")]
    pub radius_iterations: usize,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            input_dimension: default_dimension(),
            hidden_size: default_hidden_size(),
            spectral_radius: default_spectral_radius(),
            connectivity: default_connectivity(),
            input_scaling: default_input_scaling(),
            leak_rate: default_leak_rate(),
            ridge: default_ridge(),
            seed: default_reservoir_seed(),
            radius_iterations: default_radius_iterations(),
        }
    }
}

impl ReservoirConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.input_dimension == 0 || self.hidden_size == 0 {
            return Err(config_error(
                "reservoir.input_dimension and reservoir.hidden_size must be positive",
            ));
        }
        if !(self.spectral_radius > 0.0 && self.spectral_radius < 1.0) {
            return Err(config_error(format!(
                "reservoir.spectral_radius must lie in (0, 1), got {}",
                self.spectral_radius
            )));
        }
        if !(self.connectivity > 0.0 && self.connectivity <= 1.0) {
            return Err(config_error("reservoir.connectivity must lie in (0, 1]"));
        }
        require_positive("reservoir.input_scaling", self.input_scaling)?;
        if !(self.leak_rate > 0.0 && self.leak_rate <= 1.0) {
            return Err(config_error("reservoir.leak_rate must lie in (0, 1]"));
        }
        require_positive("reservoir.ridge", self.ridge)?;
        if self.radius_iterations < 8 {
            return Err(config_error("reservoir.radius_iterations must be at least 8"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Number of latent dimensions kept by the encoder.
    #[serde(default = "default_bottleneck")]
    pub bottleneck: usize,
    /// Power-iteration steps per principal direction.
    #[serde(default = "default_power_iterations")]
    pub iterations: usize,
    #[serde(default = "default_reconstruction_seed")]
    pub seed: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            bottleneck: default_bottleneck(),
            iterations: default_power_iterations(),
            seed: default_reconstruction_seed(),
        }
    }
}

impl ReconstructionConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.bottleneck == 0 || self.bottleneck >= self.dimension {
            return Err(config_error(format!(
                "reconstruction.bottleneck must lie in [1, {}), got {}",
                self.dimension, self.bottleneck
            )));
        }
        if self.iterations == 0 {
            return Err(config_error("reconstruction.iterations must be positive"));
        }
        Ok(())
    }
}

/// Drift-diffusion and precision parameters of the decision agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Initial decision boundary `θ₀`.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Contraction rate `λ` of the boundary.
    #[serde(default = "default_threshold_decay")]
    pub threshold_decay: f64,
    #[serde(default = "default_threshold_floor")]
    pub threshold_floor: f64,
    /// Precision smoothing factor `α`.
    #[serde(default = "default_precision_smoothing")]
    pub precision_smoothing: f64,
    #[serde(default = "default_precision_min")]
    pub precision_min: f64,
    #[serde(default = "default_precision_max")]
    pub precision_max: f64,
    #[serde(default = "default_precision_epsilon")]
    pub precision_epsilon: f64,
    /// Smoothing of the predicted evidence signal.
    #[serde(default = "default_prediction_smoothing")]
    pub prediction_smoothing: f64,
    #[serde(default = "default_weight_reservoir")]
    pub weight_reservoir: f64,
    #[serde(default = "default_weight_reconstruction")]
    pub weight_reconstruction: f64,
    #[serde(default = "default_weight_novelty")]
    pub weight_novelty: f64,
    /// Reconstruction error mapped to one unit of evidence.
    #[serde(default = "default_reconstruction_scale")]
    pub reconstruction_scale: f64,
    /// Novelty above which a vector is remembered; also one unit of evidence.
    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f64,
    /// Evidence level with zero drift.
    #[serde(default = "default_criterion")]
    pub criterion: f64,
    #[serde(default = "default_drift_gain")]
    pub drift_gain: f64,
    #[serde(default = "default_noise_std")]
    pub noise_std: f64,
    #[serde(default = "default_refractory_ticks")]
    pub refractory_ticks: u32,
    /// Prediction error that opens an accumulation episode.
    #[serde(default = "default_trigger_error")]
    pub trigger_error: f64,
    /// Fraction of `θ₀` the episodic priors may shift the start point by.
    #[serde(default = "default_start_bias")]
    pub start_bias: f64,
    /// Seed for the diffusion noise; `None` draws from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            threshold: default_threshold(),
            threshold_decay: default_threshold_decay(),
            threshold_floor: default_threshold_floor(),
            precision_smoothing: default_precision_smoothing(),
            precision_min: default_precision_min(),
            precision_max: default_precision_max(),
            precision_epsilon: default_precision_epsilon(),
            prediction_smoothing: default_prediction_smoothing(),
            weight_reservoir: default_weight_reservoir(),
            weight_reconstruction: default_weight_reconstruction(),
            weight_novelty: default_weight_novelty(),
            reconstruction_scale: default_reconstruction_scale(),
            novelty_threshold: default_novelty_threshold(),
            criterion: default_criterion(),
            drift_gain: default_drift_gain(),
            noise_std: default_noise_std(),
            refractory_ticks: default_refractory_ticks(),
            trigger_error: default_trigger_error(),
            start_bias: default_start_bias(),
            seed: None,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.dimension == 0 {
            return Err(config_error("decision.dimension must be positive"));
        }
        require_positive("decision.threshold", self.threshold)?;
        require_positive("decision.threshold_decay", self.threshold_decay)?;
        require_positive("decision.threshold_floor", self.threshold_floor)?;
        if self.threshold_floor >= self.threshold {
            return Err(config_error(
                "decision.threshold_floor must be below decision.threshold",
            ));
        }
        if !(0.0..1.0).contains(&self.precision_smoothing) {
            return Err(config_error("decision.precision_smoothing must lie in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.prediction_smoothing) {
            return Err(config_error("decision.prediction_smoothing must lie in [0, 1)"));
        }
        require_positive("decision.precision_min", self.precision_min)?;
        if self.precision_max < self.precision_min {
            return Err(config_error(
                "decision.precision_max must not be below decision.precision_min",
            ));
        }
        require_positive("decision.precision_epsilon", self.precision_epsilon)?;
        require_positive("decision.reconstruction_scale", self.reconstruction_scale)?;
        require_positive("decision.novelty_threshold", self.novelty_threshold)?;
        for (name, value) in [
            ("decision.weight_reservoir", self.weight_reservoir),
            ("decision.weight_reconstruction", self.weight_reconstruction),
            ("decision.weight_novelty", self.weight_novelty),
            ("decision.criterion", self.criterion),
            ("decision.drift_gain", self.drift_gain),
            ("decision.noise_std", self.noise_std),
            ("decision.trigger_error", self.trigger_error),
        ] {
            require_non_negative(name, value)?;
        }
        if !(0.0..=1.0).contains(&self.start_bias) {
            return Err(config_error("decision.start_bias must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Offline consolidation windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_consolidation_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_consolidation_iterations")]
    pub iterations: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Weight of the smoothness constraint between consecutive episodes.
    #[serde(default = "default_temporal_weight")]
    pub temporal_weight: f64,
    /// Weight of the attraction between episodes closer than `similarity_radius`.
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_similarity_radius")]
    pub similarity_radius: f64,
    /// Weight anchoring each episode to its observed value.
    #[serde(default = "default_anchor_weight")]
    pub anchor_weight: f64,
    /// Refit the reconstruction baseline from the consolidated baseline
    /// exemplars. Episodes remembered for their novelty never feed the refit.
    #[serde(default)]
    pub refit_baseline: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_consolidation_interval_secs(),
            iterations: default_consolidation_iterations(),
            learning_rate: default_learning_rate(),
            temporal_weight: default_temporal_weight(),
            similarity_weight: default_similarity_weight(),
            similarity_radius: default_similarity_radius(),
            anchor_weight: default_anchor_weight(),
            refit_baseline: false,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.interval_secs == 0 {
            return Err(config_error("consolidation.interval_secs must be positive"));
        }
        require_positive("consolidation.learning_rate", self.learning_rate)?;
        require_positive("consolidation.anchor_weight", self.anchor_weight)?;
        require_non_negative("consolidation.temporal_weight", self.temporal_weight)?;
        require_non_negative("consolidation.similarity_weight", self.similarity_weight)?;
        require_positive("consolidation.similarity_radius", self.similarity_radius)?;
        Ok(())
    }
}

fn default_value_max() -> f64 {
    255.0
}
fn default_rate_max_hz() -> f64 {
    100.0
}
fn default_jitter_max_secs() -> f64 {
    1.0
}
fn default_flux_limit() -> f64 {
    0.1
}
fn default_delay_max_ms() -> f64 {
    2000.0
}
fn default_pressure_max() -> f64 {
    100.0
}
fn default_energy_exponent() -> f64 {
    1.5
}
fn default_entropy_bins() -> usize {
    256
}
fn default_baseline_sigma() -> f64 {
    0.2
}
fn default_dimension() -> usize {
    FEATURE_DIM
}
fn default_recall_k() -> usize {
    5
}
fn default_hidden_size() -> usize {
    64
}
fn default_spectral_radius() -> f64 {
    0.95
}
fn default_connectivity() -> f64 {
    0.1
}
fn default_input_scaling() -> f64 {
    0.5
}
fn default_leak_rate() -> f64 {
    1.0
}
fn default_ridge() -> f64 {
    1e-3
}
fn default_reservoir_seed() -> u64 {
    42
}
fn default_radius_iterations() -> usize {
    200
}
fn default_bottleneck() -> usize {
    4
}
fn default_power_iterations() -> usize {
    100
}
fn default_reconstruction_seed() -> u64 {
    7
}
fn default_threshold() -> f64 {
    1.0
}
fn default_threshold_decay() -> f64 {
    0.1
}
fn default_threshold_floor() -> f64 {
    0.1
}
fn default_precision_smoothing() -> f64 {
    0.9
}
fn default_precision_min() -> f64 {
    0.1
}
fn default_precision_max() -> f64 {
    10.0
}
fn default_precision_epsilon() -> f64 {
    0.01
}
fn default_prediction_smoothing() -> f64 {
    0.8
}
fn default_weight_reservoir() -> f64 {
    0.2
}
fn default_weight_reconstruction() -> f64 {
    0.3
}
fn default_weight_novelty() -> f64 {
    0.5
}
fn default_reconstruction_scale() -> f64 {
    0.05
}
fn default_novelty_threshold() -> f64 {
    0.5
}
fn default_criterion() -> f64 {
    0.5
}
fn default_drift_gain() -> f64 {
    2.0
}
fn default_noise_std() -> f64 {
    0.1
}
fn default_refractory_ticks() -> u32 {
    2
}
fn default_trigger_error() -> f64 {
    0.25
}
fn default_start_bias() -> f64 {
    0.2
}
fn default_consolidation_interval_secs() -> u64 {
    300
}
fn default_consolidation_iterations() -> usize {
    10
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_temporal_weight() -> f64 {
    1.0
}
fn default_similarity_weight() -> f64 {
    0.5
}
fn default_similarity_radius() -> f64 {
    0.5
}
fn default_anchor_weight() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

fn config_error(message: impl Into<String>) -> ShunolloError {
    ShunolloError::Config(message.into())
}

fn require_positive(name: &str, value: f64) -> crate::errors::Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(config_error(format!("{name} must be positive, got {value}")))
    }
}

fn require_non_negative(name: &str, value: f64) -> crate::errors::Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(config_error(format!("{name} must be non-negative, got {value}")))
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config: Config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => {
                // Try default locations - expand ~ to actual home directory
                let home_config = dirs::home_dir()
                    .map(|h| h.join(".config/shunollo/config.toml"))
                    .and_then(|p| p.to_str().map(String::from));

                let mut default_paths: Vec<String> = vec!["shunollo.toml".to_string()];
                if let Some(hc) = home_config {
                    default_paths.push(hc);
                }

                let mut loaded = None;
                for p in &default_paths {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        loaded = Some(
                            toml::from_str(&content)
                                .with_context(|| format!("Failed to parse config {}", p))?,
                        );
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override selected fields from `SHUNOLLO_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SHUNOLLO_MEMORY_PATH") {
            self.memory.log_path = Some(PathBuf::from(path));
        }
        if let Some(k) = env_parse::<usize>("SHUNOLLO_RECALL_K") {
            self.memory.recall_k = k;
        }
        if let Some(h) = env_parse::<usize>("SHUNOLLO_HIDDEN_SIZE") {
            self.reservoir.hidden_size = h;
        }
        if let Some(seed) = env_parse::<u64>("SHUNOLLO_SEED") {
            self.reservoir.seed = seed;
            self.decision.seed = Some(seed);
        }
        if let Some(t) = env_parse::<f64>("SHUNOLLO_NOVELTY_THRESHOLD") {
            self.decision.novelty_threshold = t;
        }
    }

    /// Check every section, then that all of them use `FEATURE_DIM`.
    pub fn validate(&self) -> crate::errors::Result<()> {
        self.extractor.validate()?;
        self.memory.validate()?;
        self.reservoir.validate()?;
        self.reconstruction.validate()?;
        self.decision.validate()?;
        self.consolidation.validate()?;

        let d = self.memory.dimension;
        if d != FEATURE_DIM {
            return Err(config_error(format!(
                "memory.dimension must be the canonical fingerprint size {FEATURE_DIM}, got {d}"
            )));
        }
        if self.reservoir.input_dimension != d
            || self.reconstruction.dimension != d
            || self.decision.dimension != d
        {
            return Err(config_error(format!(
                "all sections must share memory.dimension = {d}"
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
