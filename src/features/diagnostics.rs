//! Window health statistics reported next to the fingerprint.
//!
//! None of these enter the feature vector. They describe how trustworthy a
//! window is: how chaotic its steps are, which noise process dominates it and
//! whether it holds enough events to be more than shot noise.

use serde::Serialize;

/// Weber fraction used when counting perceptible steps.
pub const WEBER_FRACTION: f64 = 0.1;

/// Chaos proxy in `[0, 1]`: spread of the absolute step sizes relative to
/// their mean. Constant steps give 0. Fewer than five values give 1.
pub fn chaos_index(values: &[f64]) -> f64 {
    if values.len() < 5 {
        return 1.0;
    }
    let steps: Vec<f64> = values.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    if steps.iter().any(|s| !s.is_finite()) {
        return 1.0;
    }
    let n = steps.len() as f64;
    let mean = steps.iter().sum::<f64>() / n;
    let sample_var = steps.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / (n - 1.0);
    (sample_var.sqrt() / (mean + 1.0)).min(1.0)
}

/// Allan deviation over non-overlapping averages at `m = 1, 2, 4, ..`
/// samples, up to a quarter of the window. Returns `(tau, sigma)` pairs with
/// `tau = m / sample_rate`. Fewer than four samples give nothing.
pub fn allan_deviation(samples: &[f64], sample_rate: f64) -> Vec<(f64, f64)> {
    let n = samples.len();
    if n < 4 || !(sample_rate > 0.0) || !sample_rate.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut m = 1;
    while m <= n / 4 {
        let averages: Vec<f64> = samples
            .chunks_exact(m)
            .map(|c| c.iter().sum::<f64>() / m as f64)
            .collect();
        if averages.len() < 2 {
            break;
        }
        let diffs = averages.windows(2).map(|w| (w[1] - w[0]) * (w[1] - w[0]));
        let avar = 0.5 * diffs.sum::<f64>() / (averages.len() - 1) as f64;
        out.push((m as f64 / sample_rate, avar.max(0.0).sqrt()));
        m *= 2;
    }
    out
}

/// Canonical noise processes, keyed by their log-log Allan slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseClass {
    Quantization,
    RandomWalk,
    BiasInstability,
    RateRandomWalk,
    DriftRamp,
    Unknown,
}

impl NoiseClass {
    const CANONICAL: [NoiseClass; 5] = [
        NoiseClass::Quantization,
        NoiseClass::RandomWalk,
        NoiseClass::BiasInstability,
        NoiseClass::RateRandomWalk,
        NoiseClass::DriftRamp,
    ];

    pub fn slope(self) -> Option<f64> {
        match self {
            NoiseClass::Quantization => Some(-1.0),
            NoiseClass::RandomWalk => Some(-0.5),
            NoiseClass::BiasInstability => Some(0.0),
            NoiseClass::RateRandomWalk => Some(0.5),
            NoiseClass::DriftRamp => Some(1.0),
            NoiseClass::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseProfile {
    pub class: NoiseClass,
    pub slope: f64,
    /// Coefficient of determination of the log-log fit.
    pub r_squared: f64,
}

impl NoiseProfile {
    const UNKNOWN: NoiseProfile = NoiseProfile {
        class: NoiseClass::Unknown,
        slope: 0.0,
        r_squared: 0.0,
    };
}

/// Least-squares slope of `log10 sigma` against `log10 tau`, snapped to the
/// nearest canonical class. Needs three points with positive sigma.
pub fn classify_noise(deviation: &[(f64, f64)]) -> NoiseProfile {
    let points: Vec<(f64, f64)> = deviation
        .iter()
        .filter(|(tau, sigma)| *tau > 0.0 && *sigma > 0.0)
        .map(|(tau, sigma)| (tau.log10(), sigma.log10()))
        .collect();
    if points.len() < 3 {
        return NoiseProfile::UNKNOWN;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.0 - mean_x)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    if sxx <= 0.0 {
        return NoiseProfile::UNKNOWN;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_res: f64 = points
        .iter()
        .map(|p| {
            let r = p.1 - (slope * p.0 + intercept);
            r * r
        })
        .sum();
    let ss_tot: f64 = points.iter().map(|p| (p.1 - mean_y) * (p.1 - mean_y)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let class = NoiseClass::CANONICAL
        .into_iter()
        .min_by(|a, b| {
            let da = (slope - a.slope().unwrap_or(0.0)).abs();
            let db = (slope - b.slope().unwrap_or(0.0)).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(NoiseClass::Unknown);

    NoiseProfile {
        class,
        slope,
        r_squared,
    }
}

/// Shot-noise limited detection of sparse events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoissonDetector {
    /// Background event rate producing false positives.
    pub dark_noise: f64,
    /// Coincident events needed to trigger.
    pub threshold_events: u32,
}

impl Default for PoissonDetector {
    fn default() -> Self {
        Self {
            dark_noise: 0.01,
            threshold_events: 5,
        }
    }
}

impl PoissonDetector {
    /// `P(N >= threshold)` for `N ~ Poisson(mean_events)`.
    pub fn detection_probability(&self, mean_events: f64) -> f64 {
        if !(mean_events > 0.0) || !mean_events.is_finite() {
            return 0.0;
        }
        let mut term = (-mean_events).exp();
        let mut below = 0.0;
        for k in 0..self.threshold_events {
            if k > 0 {
                term *= mean_events / f64::from(k);
            }
            below += term;
        }
        (1.0 - below).clamp(0.0, 1.0)
    }

    /// `signal / sqrt(signal + dark)`.
    pub fn signal_to_noise(&self, signal_events: f64) -> f64 {
        if !(signal_events > 0.0) || !signal_events.is_finite() {
            return 0.0;
        }
        signal_events / (signal_events + self.dark_noise).sqrt()
    }
}

/// Health statistics for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowDiagnostics {
    pub chaos: f64,
    pub noise: NoiseProfile,
    /// Stevens-scaled latency: long waits feel disproportionately long.
    pub perceived_latency: f64,
    /// Stevens-scaled rate: extra throughput is felt less and less.
    pub perceived_throughput: f64,
    /// Fraction of steps larger than the Weber JND of the preceding sample.
    pub perceptible_change: f64,
    pub detection_probability: f64,
    pub signal_to_noise: f64,
}
