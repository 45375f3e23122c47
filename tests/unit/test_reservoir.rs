//! Unit tests for the temporal reservoir

use ndarray::Array1;

use shunollo::config::ReservoirConfig;
use shunollo::errors::ShunolloError;
use shunollo::features::{FeatureVector, FEATURE_DIM};
use shunollo::reservoir::{Readout, TemporalReservoir};
use shunollo::training::{CancelToken, Trainer};

fn small() -> ReservoirConfig {
    ReservoirConfig {
        hidden_size: 24,
        ..Default::default()
    }
}

// ============================================================================
// Construction Tests
// ============================================================================

mod construction_tests {
    use super::*;

    #[test]
    fn test_rejects_unstable_radius() {
        let result = TemporalReservoir::new(ReservoirConfig {
            spectral_radius: 1.5,
            ..small()
        });
        assert!(matches!(result, Err(ShunolloError::Config(_))));
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = TemporalReservoir::new(small()).unwrap();
        let mut b = TemporalReservoir::new(ReservoirConfig { seed: 99, ..small() }).unwrap();
        let v = FeatureVector::new(vec![0.4; FEATURE_DIM]).unwrap();
        a.advance(&v).unwrap();
        b.advance(&v).unwrap();
        assert_ne!(a.state(), b.state());
    }
}

// ============================================================================
// Readout Tests
// ============================================================================

mod readout_tests {
    use super::*;

    #[test]
    fn test_readout_recovers_linear_target() {
        let history: Vec<(Array1<f64>, f64)> = (0..40)
            .map(|i| {
                let x = f64::from(i) / 40.0;
                (Array1::from(vec![x, x * x]), 2.0 * x + 0.5)
            })
            .collect();
        let readout = Readout::fit(&history, 2, 1e-9, &CancelToken::new()).unwrap();
        let prediction = readout.predict(&Array1::from(vec![0.5, 0.25]));
        assert!((prediction - 1.5).abs() < 1e-3, "prediction = {prediction}");
    }

    #[test]
    fn test_readout_rejects_empty_history() {
        assert!(Readout::fit(&[], 4, 1e-3, &CancelToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_background_retrain_serves_new_readout() {
        let mut reservoir = TemporalReservoir::new(small()).unwrap();
        let mut history = Vec::new();
        for i in 0..40 {
            let x = if i % 2 == 0 { 0.1 } else { 0.9 };
            reservoir
                .advance(&FeatureVector::new(vec![x; FEATURE_DIM]).unwrap())
                .unwrap();
            history.push((reservoir.state().clone(), x));
        }
        assert!(reservoir.score().is_err());

        Trainer::new()
            .retrain_readout(
                reservoir.readout_slot(),
                reservoir.hidden_size(),
                reservoir.config().ridge,
                history,
            )
            .await
            .unwrap();
        assert!(reservoir.score().unwrap().is_finite());
    }
}
