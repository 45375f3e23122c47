//! Precision tracking from evidence prediction errors.
//!
//! Precision is the agent's confidence in its own evidence stream. Every tick
//! the instantaneous precision `1/(e² + ε)` of the prediction error is
//! clamped and folded into a running estimate by exponential smoothing.

use serde::Serialize;

use crate::config::DecisionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrecisionState {
    pub precision: f64,
    /// Smoothed evidence signal the next tick is compared against.
    pub predicted_signal: Option<f64>,
}

/// Per-agent precision estimator. Reset only through an explicit restart.
#[derive(Debug, Clone)]
pub struct PrecisionTracker {
    precision: f64,
    predicted: Option<f64>,
    alpha: f64,
    prediction_alpha: f64,
    min: f64,
    max: f64,
    epsilon: f64,
}

impl PrecisionTracker {
    /// Precision an agent starts from.
    pub const INITIAL_PRECISION: f64 = 1.0;

    #[must_use]
    pub fn new(config: &DecisionConfig) -> Self {
        Self {
            precision: Self::INITIAL_PRECISION.clamp(config.precision_min, config.precision_max),
            predicted: None,
            alpha: config.precision_smoothing,
            prediction_alpha: config.prediction_smoothing,
            min: config.precision_min,
            max: config.precision_max,
            epsilon: config.precision_epsilon,
        }
    }

    /// Prediction error of `signal` against the current prediction.
    /// The first observation is its own prediction.
    #[must_use]
    pub fn prediction_error(&self, signal: f64) -> f64 {
        signal - self.predicted.unwrap_or(signal)
    }

    /// Precision and prediction after observing `signal`, without mutating.
    #[must_use]
    pub fn peek(&self, signal: f64) -> PrecisionState {
        let error = self.prediction_error(signal);
        let instant = (1.0 / (error * error + self.epsilon)).clamp(self.min, self.max);
        let precision = self.alpha * self.precision + (1.0 - self.alpha) * instant;
        let predicted = match self.predicted {
            Some(p) => self.prediction_alpha * p + (1.0 - self.prediction_alpha) * signal,
            None => signal,
        };
        PrecisionState {
            precision,
            predicted_signal: Some(predicted),
        }
    }

    pub fn commit(&mut self, state: PrecisionState) {
        self.precision = state.precision;
        self.predicted = state.predicted_signal;
    }

    #[must_use]
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Evidence weight `p / (1 + p)`, in `(0, 1)`.
    #[must_use]
    pub fn weight(&self) -> f64 {
        precision_weight(self.precision)
    }

    #[must_use]
    pub fn state(&self) -> PrecisionState {
        PrecisionState {
            precision: self.precision,
            predicted_signal: self.predicted,
        }
    }

    pub fn reset(&mut self) {
        self.precision = Self::INITIAL_PRECISION.clamp(self.min, self.max);
        self.predicted = None;
    }
}

pub fn precision_weight(precision: f64) -> f64 {
    precision / (1.0 + precision)
}
