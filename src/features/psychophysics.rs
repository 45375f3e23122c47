//! Psychophysical transfer functions and window statistics.
//!
//! Every function takes and returns dimensionless quantities; callers
//! normalize against a declared span first.

use serde::{Deserialize, Serialize};

/// Sensor modality selecting a Stevens exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Brightness,
    Loudness,
    Vibration,
    Pressure,
    Temperature,
    Pain,
    /// Expansive: perceived delay grows faster than the delay itself.
    Latency,
    /// Compressive: perceived throughput grows slower than the rate.
    Throughput,
    Linear,
}

impl Modality {
    pub fn exponent(self) -> f64 {
        match self {
            Modality::Brightness => 0.33,
            Modality::Loudness => 0.67,
            Modality::Vibration => 0.95,
            Modality::Pressure => 1.1,
            Modality::Temperature => 1.0,
            Modality::Pain => 3.5,
            Modality::Latency => 1.5,
            Modality::Throughput => 0.5,
            Modality::Linear => 1.0,
        }
    }
}

/// Stevens' power law `S = I^n` on a normalized intensity.
pub fn stevens(intensity: f64, modality: Modality) -> f64 {
    let safe = clamp_unit(intensity);
    let n = modality.exponent();
    if n == 1.0 {
        safe
    } else {
        safe.powf(n)
    }
}

/// Expansive energy law `size · rate^p`; `p > 1` is enforced by config validation.
pub fn expansive_energy(size_norm: f64, rate_norm: f64, exponent: f64) -> f64 {
    clamp_unit(clamp_unit(size_norm) * clamp_unit(rate_norm).powf(exponent))
}

/// Weber's law: the smallest noticeable change at `intensity`.
pub fn just_noticeable_difference(intensity: f64, weber_fraction: f64) -> f64 {
    intensity * weber_fraction
}

/// Shannon entropy of a histogram in bits. Empty histograms have zero entropy.
pub fn shannon_entropy(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Population variance; fewer than two values have zero variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// Von Mises equivalent of three principal stresses.
/// Uniform load gives 0, unequal load gives a positive distortion.
pub fn von_mises(s1: f64, s2: f64, s3: f64) -> f64 {
    let t1 = (s1 - s2) * (s1 - s2);
    let t2 = (s2 - s3) * (s2 - s3);
    let t3 = (s3 - s1) * (s3 - s1);
    (0.5 * (t1 + t2 + t3)).sqrt()
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
