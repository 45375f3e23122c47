//! Small dense linear-algebra kernels
//!
//! Only what the offline trainers need:
//! - Cholesky solve for the ridge normal equations
//! - Gelfand growth-rate estimate of a spectral radius
//! - Power iteration with deflation for leading principal directions

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use crate::errors::TrainingError;

/// Pivots at or below this are treated as a singular system.
const PIVOT_EPSILON: f64 = 1e-12;

/// Solve `a·x = b` for symmetric positive-definite `a`.
pub fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, TrainingError> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= PIVOT_EPSILON || !sum.is_finite() {
                    return Err(TrainingError::Singular { pivot: i });
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    // Forward: L·y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }

    // Backward: Lᵀ·x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }

    Ok(x)
}

/// Estimate the spectral radius of `w` as the mean logarithmic growth rate of
/// a random vector under repeated multiplication.
pub fn spectral_radius_estimate(w: &Array2<f64>, iterations: usize, rng: &mut StdRng) -> f64 {
    let n = w.nrows();
    if n == 0 || iterations == 0 {
        return 0.0;
    }

    let mut x: Array1<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let norm = l2_norm(&x);
    if norm == 0.0 {
        return 0.0;
    }
    x /= norm;

    // Burn-in lets the dominant mode take over before measuring.
    let burn_in = iterations / 4;
    let mut log_growth = 0.0;
    let mut measured = 0usize;

    for step in 0..iterations {
        let next = w.dot(&x);
        let growth = l2_norm(&next);
        if growth == 0.0 || !growth.is_finite() {
            return 0.0;
        }
        if step >= burn_in {
            log_growth += growth.ln();
            measured += 1;
        }
        x = next / growth;
    }

    (log_growth / measured.max(1) as f64).exp()
}

/// Leading `k` principal directions of row-centered `samples` as columns of a
/// `(dim, k)` orthonormal basis. Stops early when the residual variance is gone.
pub fn principal_directions(
    samples: ArrayView2<'_, f64>,
    k: usize,
    iterations: usize,
    rng: &mut StdRng,
) -> Array2<f64> {
    let n = samples.nrows().max(1) as f64;
    let dim = samples.ncols();
    let covariance = samples.t().dot(&samples) / n;

    let mut basis: Vec<Array1<f64>> = Vec::with_capacity(k);
    for _ in 0..k.min(dim) {
        let mut v: Array1<f64> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        orthogonalize(&mut v, &basis);
        let mut norm = l2_norm(&v);
        if norm < PIVOT_EPSILON {
            break;
        }
        v /= norm;

        for _ in 0..iterations {
            let mut next = covariance.dot(&v);
            orthogonalize(&mut next, &basis);
            norm = l2_norm(&next);
            if norm < PIVOT_EPSILON {
                break;
            }
            v = next / norm;
        }
        if norm < PIVOT_EPSILON {
            break;
        }
        basis.push(v);
    }

    let mut out = Array2::<f64>::zeros((dim, basis.len()));
    for (j, column) in basis.iter().enumerate() {
        out.column_mut(j).assign(column);
    }
    out
}

/// Column-wise mean of a batch of row vectors.
pub fn column_mean(samples: ArrayView2<'_, f64>) -> Array1<f64> {
    samples
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(samples.ncols()))
}

pub fn l2_norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

fn orthogonalize(v: &mut Array1<f64>, basis: &[Array1<f64>]) {
    for b in basis {
        let projection = v.dot(b);
        v.scaled_add(-projection, b);
    }
}
