//! Unit tests for the decision agent
//!
//! Tests cover:
//! - Bounded decision latency
//! - Precision dynamics through the public API
//! - Halting and restart

use shunollo::config::DecisionConfig;
use shunollo::decision::{AgentState, DecisionAgent, Label, Observation, PrecisionTracker};
use shunollo::errors::ShunolloError;
use shunollo::features::{FeatureVector, FEATURE_DIM};

fn observe<'a>(v: &'a FeatureVector, novelty: f64, score_a: Option<f64>) -> Observation<'a> {
    Observation {
        vector: v,
        score_r: None,
        score_a,
        novelty,
        priors: &[],
    }
}

// ============================================================================
// Latency Tests
// ============================================================================

mod latency_tests {
    use super::*;

    #[test]
    fn test_zero_drift_decides_at_tick_24() {
        let config = DecisionConfig {
            trigger_error: 0.0,
            criterion: 0.0,
            weight_reservoir: 0.0,
            weight_reconstruction: 0.0,
            weight_novelty: 0.0,
            noise_std: 0.0,
            seed: Some(5),
            ..Default::default()
        };
        let mut agent = DecisionAgent::new("zero-drift", config).unwrap();
        let v = FeatureVector::zeros(FEATURE_DIM);
        let mut ticks = 0;
        let decision = loop {
            ticks += 1;
            if let Some(d) = agent.tick(&observe(&v, 0.0, None)).unwrap().decision {
                break d;
            }
            assert!(ticks < 100, "agent never decided");
        };
        assert_eq!(ticks, 24);
        assert_eq!(decision.ticks, 24);
        assert!(decision.forced);
    }

    #[test]
    fn test_noisy_episodes_never_exceed_bound() {
        let config = DecisionConfig {
            trigger_error: 0.0,
            criterion: 0.5,
            noise_std: 0.3,
            refractory_ticks: 0,
            seed: Some(17),
            ..Default::default()
        };
        let mut agent = DecisionAgent::new("noisy", config).unwrap();
        let bound = agent.max_accumulation_ticks();
        let v = FeatureVector::zeros(FEATURE_DIM);
        for i in 0..500 {
            let novelty = if i % 7 == 0 { 0.3 } else { 0.2 };
            if let Some(d) = agent.tick(&observe(&v, novelty, None)).unwrap().decision {
                assert!(d.ticks <= bound, "{} > {bound}", d.ticks);
                assert!((0.0..=1.0).contains(&d.confidence));
            }
        }
    }
}

// ============================================================================
// Evidence Tests
// ============================================================================

mod evidence_tests {
    use super::*;

    fn agent() -> DecisionAgent {
        DecisionAgent::new(
            "evidence",
            DecisionConfig {
                noise_std: 0.0,
                seed: Some(2),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_reconstruction_error_alone_can_signal_anomaly() {
        let mut a = agent();
        let v = FeatureVector::zeros(FEATURE_DIM);
        let out = a.tick(&observe(&v, 0.0, Some(0.2))).unwrap();
        assert_eq!(out.decision.map(|d| d.label), Some(Label::Anomalous));
    }

    #[test]
    fn test_steady_quiet_stream_raises_precision() {
        let mut a = agent();
        let v = FeatureVector::zeros(FEATURE_DIM);
        for _ in 0..100 {
            a.tick(&observe(&v, 0.05, None)).unwrap();
        }
        assert!(a.precision() > 9.0);
        assert_eq!(a.state(), &AgentState::Idle);
    }

    #[test]
    fn test_negative_reconstruction_score_rejected() {
        let mut a = agent();
        let v = FeatureVector::zeros(FEATURE_DIM);
        let err = a.tick(&observe(&v, 0.0, Some(-1.0))).unwrap_err();
        assert!(matches!(err, ShunolloError::InputValidation(_)));
    }
}

// ============================================================================
// Halt Tests
// ============================================================================

mod halt_tests {
    use super::*;

    #[test]
    fn test_halted_agent_stays_halted_until_restart() {
        let mut agent = DecisionAgent::new(
            "halting",
            DecisionConfig {
                drift_gain: f64::MAX,
                weight_novelty: 10.0,
                noise_std: 0.0,
                seed: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        let v = FeatureVector::zeros(FEATURE_DIM);
        assert!(agent.tick(&observe(&v, 4.0, None)).is_err());
        for _ in 0..3 {
            let err = agent.tick(&observe(&v, 0.0, None)).unwrap_err();
            assert!(err.is_fatal());
        }
        agent.restart();
        assert_eq!(agent.precision(), PrecisionTracker::INITIAL_PRECISION);
        assert!(agent.tick(&observe(&v, 0.0, None)).is_ok());
    }
}
