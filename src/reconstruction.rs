//! Reconstruction Scoring
//!
//! Linear bottleneck autoencoder over fingerprints. The encoder projects onto
//! the leading principal directions of a baseline batch and the decoder maps
//! back; the reconstruction error of a vector measures how far it sits from
//! the baseline manifold.
//!
//! The optimum of the linear reconstruction objective is the principal
//! subspace, so fitting is a batch eigen-decomposition rather than gradient
//! descent. The fitted model is frozen while serving and replaced atomically.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ReconstructionConfig;
use crate::errors::{InputValidationError, Result, ShunolloError, TrainingError};
use crate::features::FeatureVector;
use crate::linalg;
use crate::training::{CancelToken, ModelSlot};

pub const MODEL_NAME: &str = "reconstruction";

/// Mean and orthonormal bottleneck basis of a baseline batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    mean: Array1<f64>,
    /// `(dimension, latent)` with orthonormal columns.
    basis: Array2<f64>,
    trained_on: usize,
}

impl BaselineModel {
    /// Fit on `batch`; each vector must match `config.dimension`.
    pub fn fit(
        batch: &[FeatureVector],
        config: &ReconstructionConfig,
        cancel: &CancelToken,
    ) -> Result<Self> {
        if batch.is_empty() {
            return Err(InputValidationError::EmptyBatch.into());
        }
        if batch.len() < 2 {
            return Err(TrainingError::InsufficientData {
                needed: 2,
                got: batch.len(),
            }
            .into());
        }

        let dim = config.dimension;
        let mut samples = Array2::<f64>::zeros((batch.len(), dim));
        for (row, v) in batch.iter().enumerate() {
            v.validate(dim)?;
            for (col, &x) in v.values().iter().enumerate() {
                samples[[row, col]] = x;
            }
        }
        cancel.check()?;

        let mean = linalg::column_mean(samples.view());
        for mut row in samples.rows_mut() {
            row -= &mean;
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let basis =
            linalg::principal_directions(samples.view(), config.bottleneck, config.iterations, &mut rng);
        cancel.check()?;

        Ok(Self {
            mean,
            basis,
            trained_on: batch.len(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Directions actually kept; below the configured bottleneck when the
    /// baseline has lower rank.
    pub fn latent_dimension(&self) -> usize {
        self.basis.ncols()
    }

    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    pub fn encode(&self, values: &[f64]) -> Array1<f64> {
        let centered = Array1::from_iter(values.iter().copied()) - &self.mean;
        self.basis.t().dot(&centered)
    }

    pub fn decode(&self, latent: &Array1<f64>) -> Array1<f64> {
        &self.mean + &self.basis.dot(latent)
    }

    /// Mean squared error between `values` and its reconstruction.
    pub fn reconstruction_error(&self, values: &[f64]) -> f64 {
        let reconstructed = self.decode(&self.encode(values));
        let n = values.len().max(1) as f64;
        values
            .iter()
            .zip(reconstructed.iter())
            .map(|(x, r)| (x - r) * (x - r))
            .sum::<f64>()
            / n
    }
}

/// Serves reconstruction error against the current baseline snapshot.
#[derive(Debug)]
pub struct ReconstructionScorer {
    config: ReconstructionConfig,
    model: ModelSlot<BaselineModel>,
}

impl ReconstructionScorer {
    pub fn new(config: ReconstructionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            model: ModelSlot::new(),
        })
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    /// Fit synchronously and swap the new baseline in.
    pub fn train_baseline(&self, batch: &[FeatureVector]) -> Result<()> {
        let model = BaselineModel::fit(batch, &self.config, &CancelToken::new())?;
        info!(
            samples = model.trained_on(),
            latent = model.latent_dimension(),
            "Reconstruction baseline installed"
        );
        self.model.store(model);
        Ok(())
    }

    /// `score(v)`: reconstruction MSE. Fails with `UntrainedModel` before training.
    pub fn score(&self, vector: &FeatureVector) -> Result<f64> {
        vector.validate(self.config.dimension)?;
        let model = self.model.load().ok_or(ShunolloError::UntrainedModel {
            model: MODEL_NAME,
        })?;
        Ok(model.reconstruction_error(vector.values()))
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_ready()
    }

    /// Shared slot for background retraining.
    pub fn model_slot(&self) -> ModelSlot<BaselineModel> {
        self.model.clone()
    }
}
