//! Temporal Reservoir
//!
//! Echo-state recurrent scorer. A fixed random recurrent network integrates
//! the fingerprint stream; only the linear readout is ever trained.
//!
//! Features:
//! - Sparse recurrent matrix rescaled to a target spectral radius
//! - Leaky `tanh` state update, O(H²) per tick with no optimization inside
//! - Seeded construction for reproducible weights
//! - Ridge readout swapped in atomically by a background trainer

pub mod readout;

pub use readout::Readout;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::ReservoirConfig;
use crate::errors::{Result, ShunolloError};
use crate::features::FeatureVector;
use crate::linalg;
use crate::training::{CancelToken, ModelSlot};

pub const MODEL_NAME: &str = "reservoir_readout";

/// Estimated radius below which the recurrent matrix cannot be rescaled.
const DEGENERATE_RADIUS: f64 = 1e-9;

pub struct TemporalReservoir {
    config: ReservoirConfig,
    /// `(H, D)`
    w_in: Array2<f64>,
    /// `(H, H)`
    w: Array2<f64>,
    state: Array1<f64>,
    readout: ModelSlot<Readout>,
    estimated_radius: f64,
}

impl TemporalReservoir {
    pub fn new(config: ReservoirConfig) -> Result<Self> {
        config.validate()?;
        let h = config.hidden_size;
        let d = config.input_dimension;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let scale = config.input_scaling;
        let w_in = Array2::from_shape_fn((h, d), |_| rng.random_range(-scale..=scale));

        let mut w = Array2::<f64>::zeros((h, h));
        for i in 0..h {
            let mut connected = false;
            for j in 0..h {
                if rng.random_bool(config.connectivity) {
                    w[[i, j]] = rng.random_range(-1.0..1.0);
                    connected = true;
                }
            }
            // Every unit keeps at least one recurrent input.
            if !connected {
                let j = rng.random_range(0..h);
                w[[i, j]] = rng.random_range(-1.0..1.0);
            }
        }

        let raw_radius = linalg::spectral_radius_estimate(&w, config.radius_iterations, &mut rng);
        if raw_radius < DEGENERATE_RADIUS {
            return Err(ShunolloError::Config(format!(
                "recurrent matrix is degenerate (radius {raw_radius:e}); raise reservoir.connectivity"
            )));
        }
        w *= config.spectral_radius / raw_radius;
        let estimated_radius =
            linalg::spectral_radius_estimate(&w, config.radius_iterations, &mut rng);

        debug!(
            hidden = h,
            raw_radius, estimated_radius, "Reservoir initialized"
        );

        Ok(Self {
            w_in,
            w,
            state: Array1::zeros(h),
            readout: ModelSlot::new(),
            estimated_radius,
            config,
        })
    }

    pub fn config(&self) -> &ReservoirConfig {
        &self.config
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Spectral radius of the recurrent matrix measured after rescaling.
    pub fn spectral_radius(&self) -> f64 {
        self.estimated_radius
    }

    pub fn state(&self) -> &Array1<f64> {
        &self.state
    }

    /// Validate `vector`, then apply `x' = (1−a)·x + a·tanh(W_in·v + W·x)`.
    pub fn advance(&mut self, vector: &FeatureVector) -> Result<()> {
        vector.validate(self.config.input_dimension)?;
        let input = Array1::from_iter(vector.values().iter().copied());
        let pre = self.w_in.dot(&input) + self.w.dot(&self.state);
        let a = self.config.leak_rate;
        if a >= 1.0 {
            self.state = pre.mapv(f64::tanh);
        } else {
            self.state = self.state.mapv(|x| (1.0 - a) * x) + pre.mapv(|p| a * p.tanh());
        }
        Ok(())
    }

    /// Readout of the current state. `UntrainedModel` until a readout is installed.
    pub fn score(&self) -> Result<f64> {
        let readout = self.readout.load().ok_or(ShunolloError::UntrainedModel {
            model: MODEL_NAME,
        })?;
        Ok(readout.predict(&self.state))
    }

    /// `advance` followed by `score`.
    pub fn tick(&mut self, vector: &FeatureVector) -> Result<f64> {
        self.advance(vector)?;
        self.score()
    }

    pub fn reset(&mut self) {
        self.state.fill(0.0);
    }

    /// Fit the readout synchronously and install it.
    pub fn train_readout(&self, history: &[(Array1<f64>, f64)]) -> Result<()> {
        let readout = Readout::fit(
            history,
            self.config.hidden_size,
            self.config.ridge,
            &CancelToken::new(),
        )?;
        info!(samples = history.len(), "Reservoir readout installed");
        self.readout.store(readout);
        Ok(())
    }

    pub fn is_trained(&self) -> bool {
        self.readout.is_ready()
    }

    /// Shared slot for background retraining.
    pub fn readout_slot(&self) -> ModelSlot<Readout> {
        self.readout.clone()
    }
}

impl std::fmt::Debug for TemporalReservoir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporalReservoir")
            .field("hidden_size", &self.config.hidden_size)
            .field("input_dimension", &self.config.input_dimension)
            .field("spectral_radius", &self.estimated_radius)
            .field("trained", &self.is_trained())
            .finish()
    }
}
