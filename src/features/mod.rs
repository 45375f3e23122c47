//! Signal Fingerprints
//!
//! Turns a raw sample window into a fixed-size, dimensionless feature vector.
//! Features:
//! - Versioned schema with one canonical dimensionality
//! - Validation shared by every downstream component
//! - Euclidean distance used by recall and novelty
//! - Pure, thread-safe extraction (see [`extractor`])
//! - Per-window health statistics outside the vector (see [`diagnostics`])

pub mod diagnostics;
pub mod extractor;
pub mod psychophysics;

pub use diagnostics::WindowDiagnostics;
pub use extractor::{ExtractorConfig, FeatureExtractor, WindowParams};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::InputValidationError;

/// Canonical number of dimensions in a fingerprint.
pub const FEATURE_DIM: usize = 16;

/// Bumped whenever the meaning or order of dimensions changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Named dimensions of the canonical fingerprint, in vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Entropy,
    Flux,
    Jitter,
    Viscosity,
    Energy,
    Loudness,
    Roughness,
    Harmony,
    Dissonance,
    Volatility,
    Strain,
    Hamiltonian,
    Ewr,
    Distortion,
    Level,
    Peak,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_DIM] = [
        Feature::Entropy,
        Feature::Flux,
        Feature::Jitter,
        Feature::Viscosity,
        Feature::Energy,
        Feature::Loudness,
        Feature::Roughness,
        Feature::Harmony,
        Feature::Dissonance,
        Feature::Volatility,
        Feature::Strain,
        Feature::Hamiltonian,
        Feature::Ewr,
        Feature::Distortion,
        Feature::Level,
        Feature::Peak,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::Entropy => "entropy",
            Feature::Flux => "flux",
            Feature::Jitter => "jitter",
            Feature::Viscosity => "viscosity",
            Feature::Energy => "energy",
            Feature::Loudness => "loudness",
            Feature::Roughness => "roughness",
            Feature::Harmony => "harmony",
            Feature::Dissonance => "dissonance",
            Feature::Volatility => "volatility",
            Feature::Strain => "strain",
            Feature::Hamiltonian => "hamiltonian",
            Feature::Ewr => "ewr",
            Feature::Distortion => "distortion",
            Feature::Level => "level",
            Feature::Peak => "peak",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated fingerprint. Every value is finite and inside `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector from already-normalized values, rejecting anything
    /// non-finite or outside `[0, 1]`.
    pub fn new(values: Vec<f64>) -> Result<Self, InputValidationError> {
        check_values(&values)?;
        Ok(Self::from_checked(values))
    }

    /// Build a vector by clamping into `[0, 1]`; non-finite values become `0`.
    pub fn sanitized(values: Vec<f64>) -> Self {
        let values = values
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Self::from_checked(values)
    }

    /// An all-zero vector of the given dimension.
    pub fn zeros(dimension: usize) -> Self {
        Self::from_checked(vec![0.0; dimension])
    }

    fn from_checked(values: Vec<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            values,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Value of a named dimension. Vectors shorter than the canonical schema
    /// report `0` for missing dimensions.
    pub fn get(&self, feature: Feature) -> f64 {
        self.values.get(feature.index()).copied().unwrap_or(0.0)
    }

    /// Full validation against a component's configured dimension.
    pub fn validate(&self, expected_dimension: usize) -> Result<(), InputValidationError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(InputValidationError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                got: self.schema_version,
            });
        }
        if self.values.len() != expected_dimension {
            return Err(InputValidationError::DimensionMismatch {
                expected: expected_dimension,
                got: self.values.len(),
            });
        }
        check_values(&self.values)
    }

    /// Euclidean distance; callers validate dimensions first.
    pub fn distance(&self, other: &FeatureVector) -> f64 {
        euclidean_distance(&self.values, &other.values)
    }
}

/// `sqrt(Σ (p_i − q_i)²)` over the common prefix.
pub fn euclidean_distance(p: &[f64], q: &[f64]) -> f64 {
    p.iter()
        .zip(q.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

fn check_values(values: &[f64]) -> Result<(), InputValidationError> {
    for (index, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(InputValidationError::NonFinite { index, value });
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(InputValidationError::OutOfRange {
                index,
                value,
                min: 0.0,
                max: 1.0,
            });
        }
    }
    Ok(())
}
