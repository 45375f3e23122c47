//! Unit tests for fingerprint extraction
//!
//! Tests cover:
//! - Zero and empty windows
//! - Energy scaling with rate
//! - Distance properties
//! - Validation of hand-built vectors

use shunollo::config::ExtractorConfig;
use shunollo::errors::InputValidationError;
use shunollo::features::psychophysics::{shannon_entropy, stevens, Modality};
use shunollo::features::{
    euclidean_distance, Feature, FeatureExtractor, FeatureVector, WindowParams, FEATURE_DIM,
};

fn extractor() -> FeatureExtractor {
    FeatureExtractor::new(ExtractorConfig::default()).unwrap()
}

fn window(duration_secs: f64) -> WindowParams<'static> {
    WindowParams {
        duration_secs,
        ..Default::default()
    }
}

// ============================================================================
// Extraction Tests
// ============================================================================

mod extraction_tests {
    use super::*;

    #[test]
    fn test_all_zero_window_has_zero_energy_and_entropy() {
        let v = extractor().extract(&[0.0; 128], &window(1.0));
        assert_eq!(v.get(Feature::Energy), 0.0);
        assert_eq!(v.get(Feature::Entropy), 0.0);
        assert_eq!(v.get(Feature::Roughness), 0.0);
        assert_eq!(v.get(Feature::Peak), 0.0);
    }

    #[test]
    fn test_doubling_rate_scales_energy() {
        let e = extractor();
        let slow = e.extract(&[100.0; 10], &window(1.0));
        let fast = e.extract(&[100.0; 20], &window(1.0));
        let ratio = fast.get(Feature::Energy) / slow.get(Feature::Energy);
        assert!((ratio - 2f64.powf(1.5)).abs() < 1e-9, "ratio = {ratio}");
    }

    #[test]
    fn test_every_value_in_unit_range() {
        let samples: Vec<f64> = (0..300).map(|i| ((i * 37) % 256) as f64).collect();
        let times: Vec<f64> = (0..300).map(|i| f64::from(i) * 0.003).collect();
        let params = WindowParams {
            arrival_times: Some(&times[..]),
            latency_ms: 900.0,
            queue_depth: 250.0,
            error_rate: 0.4,
            protocol_valid: false,
            port_standard: false,
            ..Default::default()
        };
        let v = extractor().extract(&samples, &params);
        assert!(v.values().iter().all(|x| (0.0..=1.0).contains(x)));
        assert!(v.validate(FEATURE_DIM).is_ok());
    }

    #[test]
    fn test_non_finite_samples_never_escape() {
        let v = extractor().extract(&[f64::NAN, f64::INFINITY, -3.0, 1e300], &window(0.0));
        assert!(v.values().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_hidden_encryption_lowers_harmony() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let e = extractor();
        let plain = e.extract_bytes(&bytes, &window(1.0));
        let expected = e.extract_bytes(
            &bytes,
            &WindowParams {
                expected_high_entropy: true,
                ..window(1.0)
            },
        );
        assert!(plain.get(Feature::Entropy) > 0.99);
        assert!(plain.get(Feature::Harmony) < expected.get(Feature::Harmony));
    }
}

// ============================================================================
// Vector Tests
// ============================================================================

mod vector_tests {
    use super::*;

    #[test]
    fn test_distance_symmetric_and_zero_on_self() {
        let p = FeatureVector::new(vec![0.1; FEATURE_DIM]).unwrap();
        let q = FeatureVector::new(vec![0.6; FEATURE_DIM]).unwrap();
        assert_eq!(p.distance(&q), q.distance(&p));
        assert_eq!(p.distance(&p), 0.0);
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_rejected_with_index() {
        let mut values = vec![0.5; FEATURE_DIM];
        values[7] = 1.5;
        match FeatureVector::new(values) {
            Err(InputValidationError::OutOfRange { index, .. }) => assert_eq!(index, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let v = FeatureVector::zeros(8);
        assert_eq!(
            v.validate(FEATURE_DIM),
            Err(InputValidationError::DimensionMismatch {
                expected: FEATURE_DIM,
                got: 8
            })
        );
    }

    #[test]
    fn test_vectors_roundtrip_through_json() {
        let v = FeatureVector::new(vec![0.25; FEATURE_DIM]).unwrap();
        let back: FeatureVector = serde_json::from_str(&serde_json::to_string(&v).unwrap()).unwrap();
        assert_eq!(back.id, v.id);
        assert_eq!(back.values(), v.values());
    }
}

// ============================================================================
// Psychophysics Tests
// ============================================================================

mod psychophysics_tests {
    use super::*;

    #[test]
    fn test_uniform_histogram_entropy() {
        assert!((shannon_entropy(&[5, 5, 5, 5]) - 2.0).abs() < 1e-12);
        assert_eq!(shannon_entropy(&[]), 0.0);
    }

    #[test]
    fn test_stevens_latency_is_expansive() {
        assert!(stevens(0.5, Modality::Latency) < 0.5);
    }
}
