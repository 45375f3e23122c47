//! Linear readout fitted by closed-form ridge regression.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::errors::{InputValidationError, Result};
use crate::linalg;
use crate::training::CancelToken;

/// Rows accumulated between cancellation checks.
const CANCEL_CHECK_STRIDE: usize = 256;

/// `H + 1` coefficients, bias last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    weights: Array1<f64>,
}

impl Readout {
    pub fn from_weights(weights: Array1<f64>) -> Self {
        Self { weights }
    }

    /// Solve `(XᵀX + λI) w = Xᵀy` where each row of `X` is `[state; 1]`.
    pub fn fit(
        history: &[(Array1<f64>, f64)],
        hidden_size: usize,
        ridge: f64,
        cancel: &CancelToken,
    ) -> Result<Self> {
        if history.is_empty() {
            return Err(InputValidationError::EmptyBatch.into());
        }

        let n = hidden_size + 1;
        let mut gram = Array2::<f64>::zeros((n, n));
        let mut rhs = Array1::<f64>::zeros(n);
        let mut row = Array1::<f64>::zeros(n);

        for (i, (state, label)) in history.iter().enumerate() {
            if state.len() != hidden_size {
                return Err(InputValidationError::DimensionMismatch {
                    expected: hidden_size,
                    got: state.len(),
                }
                .into());
            }
            if let Some((index, &value)) = state.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                return Err(InputValidationError::NonFinite { index, value }.into());
            }
            if !label.is_finite() {
                return Err(InputValidationError::InvalidScalar {
                    field: "label",
                    value: *label,
                }
                .into());
            }
            if i % CANCEL_CHECK_STRIDE == 0 {
                cancel.check()?;
            }

            row.slice_mut(ndarray::s![..hidden_size]).assign(state);
            row[hidden_size] = 1.0;
            for a in 0..n {
                let ra = row[a];
                rhs[a] += ra * label;
                for b in 0..n {
                    gram[[a, b]] += ra * row[b];
                }
            }
        }

        for d in 0..n {
            gram[[d, d]] += ridge;
        }
        cancel.check()?;

        let weights = linalg::cholesky_solve(&gram, &rhs)?;
        Ok(Self { weights })
    }

    pub fn hidden_size(&self) -> usize {
        self.weights.len().saturating_sub(1)
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// `W_out · [x; 1]`
    pub fn predict(&self, state: &Array1<f64>) -> f64 {
        let h = self.hidden_size();
        let linear: f64 = self
            .weights
            .iter()
            .take(h)
            .zip(state.iter())
            .map(|(w, x)| w * x)
            .sum();
        linear + self.weights[h]
    }
}
