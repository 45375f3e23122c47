//! Window → fingerprint extraction.

use tracing::trace;

use super::diagnostics::{
    allan_deviation, chaos_index, classify_noise, PoissonDetector, WindowDiagnostics,
    WEBER_FRACTION,
};
use super::psychophysics::{
    clamp_unit, expansive_energy, just_noticeable_difference, shannon_entropy, stevens, variance,
    von_mises, Modality,
};
use super::{Feature, FeatureVector, FEATURE_DIM};
pub use crate::config::ExtractorConfig;
use crate::errors::Result;

/// Normalized entropy above which a plaintext window counts as hidden encryption.
const HIGH_ENTROPY_THRESHOLD: f64 = 7.0 / 8.0;

const INVALID_PROTOCOL_PENALTY: f64 = 0.5;
const NON_STANDARD_PORT_PENALTY: f64 = 0.2;
const HIDDEN_ENCRYPTION_PENALTY: f64 = 0.8;

const ROUGHNESS_ENTROPY_WEIGHT: f64 = 0.7;
const ROUGHNESS_JITTER_WEIGHT: f64 = 0.1;
const ROUGHNESS_ERROR_WEIGHT: f64 = 0.2;

/// Context describing the window the samples came from.
#[derive(Debug, Clone, Copy)]
pub struct WindowParams<'a> {
    /// Wall-clock length of the window in seconds.
    pub duration_secs: f64,
    /// Optional per-sample arrival times in seconds.
    pub arrival_times: Option<&'a [f64]>,
    pub latency_ms: f64,
    pub queue_depth: f64,
    /// Fraction of failed units in the window, `[0, 1]`.
    pub error_rate: f64,
    pub protocol_valid: bool,
    pub port_standard: bool,
    /// High entropy is expected (encrypted or compressed payloads).
    pub expected_high_entropy: bool,
}

impl Default for WindowParams<'_> {
    fn default() -> Self {
        Self {
            duration_secs: 1.0,
            arrival_times: None,
            latency_ms: 0.0,
            queue_depth: 0.0,
            error_rate: 0.0,
            protocol_valid: true,
            port_standard: true,
            expected_high_entropy: false,
        }
    }
}

/// Pure feature extractor. Holds only validated configuration, so one
/// instance can be shared across threads.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: ExtractorConfig,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract a fingerprint from numeric samples in the configured value range.
    pub fn extract(&self, samples: &[f64], window: &WindowParams<'_>) -> FeatureVector {
        if samples.is_empty() {
            return FeatureVector::zeros(FEATURE_DIM);
        }
        let normalized: Vec<f64> = samples.iter().map(|&x| self.normalize(x)).collect();
        self.compose(&normalized, window)
    }

    /// Extract from raw bytes, treating each byte as a sample in `[0, 255]`.
    pub fn extract_bytes(&self, bytes: &[u8], window: &WindowParams<'_>) -> FeatureVector {
        if bytes.is_empty() {
            return FeatureVector::zeros(FEATURE_DIM);
        }
        let normalized: Vec<f64> = bytes.iter().map(|&b| f64::from(b) / 255.0).collect();
        self.compose(&normalized, window)
    }

    /// Health statistics for the same window [`Self::extract`] would fingerprint.
    pub fn diagnose(&self, samples: &[f64], window: &WindowParams<'_>) -> WindowDiagnostics {
        let normalized: Vec<f64> = samples.iter().map(|&x| self.normalize(x)).collect();
        self.diagnostics(&normalized, window)
    }

    pub fn diagnose_bytes(&self, bytes: &[u8], window: &WindowParams<'_>) -> WindowDiagnostics {
        let normalized: Vec<f64> = bytes.iter().map(|&b| f64::from(b) / 255.0).collect();
        self.diagnostics(&normalized, window)
    }

    fn diagnostics(&self, normalized: &[f64], window: &WindowParams<'_>) -> WindowDiagnostics {
        let cfg = &self.config;
        let n = normalized.len();
        let rate = self.rate_hz(n, window);
        let latency_norm = clamp_unit(non_negative(window.latency_ms) / cfg.delay_max_ms);

        let steps = n.saturating_sub(1);
        let perceptible = normalized
            .windows(2)
            .filter(|w| (w[1] - w[0]).abs() > just_noticeable_difference(w[0], WEBER_FRACTION))
            .count();

        let sample_rate = if rate > 0.0 { rate } else { 1.0 };
        let detector = PoissonDetector::default();
        WindowDiagnostics {
            chaos: chaos_index(normalized),
            noise: classify_noise(&allan_deviation(normalized, sample_rate)),
            perceived_latency: stevens(latency_norm, Modality::Latency),
            perceived_throughput: stevens(rate / cfg.rate_max_hz, Modality::Throughput),
            perceptible_change: if steps == 0 {
                0.0
            } else {
                perceptible as f64 / steps as f64
            },
            detection_probability: detector.detection_probability(n as f64),
            signal_to_noise: detector.signal_to_noise(n as f64),
        }
    }

    /// Clamp into the declared range (`NaN` maps to the minimum) and rescale to `[0, 1]`.
    fn normalize(&self, x: f64) -> f64 {
        let min = self.config.value_min;
        let max = self.config.value_max;
        let clamped = if x.is_nan() { min } else { x.clamp(min, max) };
        (clamped - min) / (max - min)
    }

    fn compose(&self, normalized: &[f64], window: &WindowParams<'_>) -> FeatureVector {
        let cfg = &self.config;
        let n = normalized.len();

        let entropy = self.entropy(normalized);

        let diffs: Vec<f64> = normalized.windows(2).map(|w| w[1] - w[0]).collect();
        let flux = clamp_unit(variance(&diffs) / cfg.flux_limit);

        let jitter = match window.arrival_times {
            Some(times) => {
                let gaps: Vec<f64> = times
                    .windows(2)
                    .map(|w| w[1] - w[0])
                    .filter(|g| g.is_finite())
                    .collect();
                clamp_unit(variance(&gaps) / (cfg.jitter_max_secs * cfg.jitter_max_secs))
            }
            None => 0.0,
        };

        let latency_norm = clamp_unit(non_negative(window.latency_ms) / cfg.delay_max_ms);
        let pressure_norm = clamp_unit(non_negative(window.queue_depth) / cfg.pressure_max);
        let viscosity = clamp_unit(latency_norm + 0.5 * pressure_norm);

        let level = normalized.iter().sum::<f64>() / n as f64;
        let peak = normalized.iter().copied().fold(0.0, f64::max);

        let rate_norm = clamp_unit(self.rate_hz(n, window) / cfg.rate_max_hz);
        let energy = expansive_energy(level, rate_norm, cfg.energy_exponent);

        // Magnitude is measured above the declared floor so the ratio stays in [0, 1].
        let span = cfg.value_max - cfg.value_min;
        let loudness = clamp_unit((1.0 + level * span).log10() / (1.0 + span).log10());

        let error_rate = clamp_unit(window.error_rate);
        let roughness = clamp_unit(
            ROUGHNESS_ENTROPY_WEIGHT * entropy
                + ROUGHNESS_JITTER_WEIGHT * jitter
                + ROUGHNESS_ERROR_WEIGHT * error_rate,
        );

        let mut harmony = 1.0;
        if !window.protocol_valid {
            harmony -= INVALID_PROTOCOL_PENALTY;
        }
        if !window.port_standard {
            harmony -= NON_STANDARD_PORT_PENALTY;
        }
        if entropy > HIGH_ENTROPY_THRESHOLD && window.protocol_valid && !window.expected_high_entropy
        {
            harmony -= HIDDEN_ENCRYPTION_PENALTY;
        }
        let harmony = clamp_unit(harmony);

        let dissonance = clamp_unit((1.0 - harmony) * energy * peak);

        let dt = non_negative(window.duration_secs).max(0.1);
        let volatility = clamp_unit(
            (level - cfg.baseline_mean).abs() / (cfg.baseline_sigma * dt.sqrt()) / 5.0,
        );

        // Lagrangian of effort (rate) against resistance (viscosity).
        let kinetic = rate_norm;
        let potential = viscosity;
        let strain = 1.0 - clamp_unit((kinetic - potential + 1.0) / 2.0);
        let hamiltonian = (kinetic + potential) / 2.0;

        let ewr = entropy / (1.0 + latency_norm);
        let distortion = clamp_unit(von_mises(energy, viscosity, flux));

        let mut values = vec![0.0; FEATURE_DIM];
        values[Feature::Entropy.index()] = entropy;
        values[Feature::Flux.index()] = flux;
        values[Feature::Jitter.index()] = jitter;
        values[Feature::Viscosity.index()] = viscosity;
        values[Feature::Energy.index()] = energy;
        values[Feature::Loudness.index()] = loudness;
        values[Feature::Roughness.index()] = roughness;
        values[Feature::Harmony.index()] = harmony;
        values[Feature::Dissonance.index()] = dissonance;
        values[Feature::Volatility.index()] = volatility;
        values[Feature::Strain.index()] = strain;
        values[Feature::Hamiltonian.index()] = hamiltonian;
        values[Feature::Ewr.index()] = ewr;
        values[Feature::Distortion.index()] = distortion;
        values[Feature::Level.index()] = level;
        values[Feature::Peak.index()] = peak;

        trace!(samples = n, entropy, energy, "Extracted fingerprint");
        FeatureVector::sanitized(values)
    }

    /// Normalized Shannon entropy over `entropy_bins` equal-width buckets.
    fn entropy(&self, normalized: &[f64]) -> f64 {
        let bins = self.config.entropy_bins;
        let mut counts = vec![0usize; bins];
        for &u in normalized {
            let bucket = ((u * bins as f64) as usize).min(bins - 1);
            counts[bucket] += 1;
        }
        clamp_unit(shannon_entropy(&counts) / (bins as f64).log2())
    }

    /// Samples per second, from arrival times when they span a positive interval.
    fn rate_hz(&self, n: usize, window: &WindowParams<'_>) -> f64 {
        if let Some(times) = window.arrival_times {
            let finite = times.iter().copied().filter(|t| t.is_finite());
            let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), t| {
                (lo.min(t), hi.max(t))
            });
            if times.len() >= 2 && hi > lo {
                return (times.len() - 1) as f64 / (hi - lo);
            }
        }
        let duration = non_negative(window.duration_secs);
        if duration > 0.0 {
            n as f64 / duration
        } else {
            0.0
        }
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}
