//! End-to-end tests for the tick pipeline
//!
//! Tests cover:
//! - Quiet baseline followed by a high-entropy burst
//! - Concurrent mutation detection
//! - Offline consolidation feeding the reconstruction baseline from
//!   known-normal exemplars only
//! - Memory persistence across pipeline instances

use std::sync::{Arc, Barrier};
use tempfile::TempDir;

use shunollo::config::{Config, ConsolidationConfig, DecisionConfig, MemoryConfig};
use shunollo::decision::Label;
use shunollo::errors::ShunolloError;
use shunollo::features::{
    ExtractorConfig, Feature, FeatureExtractor, FeatureVector, WindowParams, FEATURE_DIM,
};
use shunollo::memory::EpisodicMemory;
use shunollo::pipeline::{Pipeline, SharedPipeline};
use shunollo::training::{BaselineTarget, Trainer};

fn config() -> Config {
    Config {
        decision: DecisionConfig {
            noise_std: 0.0,
            seed: Some(21),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 40 identical samples per second around level 20 of 255.
fn baseline_window(tick: usize) -> Vec<f64> {
    vec![19.0 + (tick % 3) as f64; 40]
}

/// 200 distinct values in one second: five times the baseline rate.
fn spike_window() -> Vec<f64> {
    (0..200).map(|i| ((i * 255) / 200) as f64).collect()
}

fn fingerprint(pipeline: &Pipeline, samples: &[f64]) -> FeatureVector {
    pipeline
        .extractor()
        .unwrap()
        .extract(samples, &WindowParams::default())
}

// ============================================================================
// Scenario Tests
// ============================================================================

mod scenario_tests {
    use super::*;

    #[test]
    fn test_spike_after_quiet_baseline_is_anomalous() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        let mut pipeline = Pipeline::from_config(&config(), Arc::clone(&memory), "scenario").unwrap();

        let exemplar = fingerprint(&pipeline, &[20.0; 40]);
        memory.remember_baseline(&exemplar).unwrap();
        let batch: Vec<FeatureVector> = (0..30)
            .map(|t| fingerprint(&pipeline, &baseline_window(t)))
            .collect();
        pipeline.train(&batch).unwrap();

        for t in 0..50 {
            let report = pipeline
                .tick_samples(&baseline_window(t), &WindowParams::default())
                .unwrap();
            assert!(report.novelty < 0.2, "tick {t}: novelty {}", report.novelty);
            assert!(report.record.is_none(), "tick {t} decided during baseline");
        }

        let spike = spike_window();
        // 200 distinct levels over 256 bins.
        let spike_vector = fingerprint(&pipeline, &spike);
        let entropy = spike_vector.get(Feature::Entropy);
        assert!((entropy - 200f64.log2() / 8.0).abs() < 1e-9, "entropy {entropy}");
        assert!(entropy > 0.95);
        assert!(fingerprint(&pipeline, &baseline_window(0)).get(Feature::Entropy) < 0.01);

        let mut decided = None;
        for offset in 0..5 {
            let report = pipeline
                .tick_samples(&spike, &WindowParams::default())
                .unwrap();
            if offset == 0 {
                assert!(report.novelty > 1.0, "spike novelty {}", report.novelty);
                assert!(report.score_a.is_some());
            }
            if let Some(record) = report.record {
                decided = Some((offset, record));
                break;
            }
        }
        let (offset, record) = decided.expect("no decision within 5 ticks of the spike");
        assert_eq!(record.label, Label::Anomalous);
        assert!(offset < 5);
        assert!(record.confidence > 0.0);
        // The spike was novel enough to be remembered.
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn test_spike_runs_at_five_times_the_baseline_rate() {
        // Wide enough that neither window saturates the rate normalization.
        let extractor = FeatureExtractor::new(ExtractorConfig {
            rate_max_hz: 400.0,
            ..Default::default()
        })
        .unwrap();
        let quiet = extractor.extract(&baseline_window(0), &WindowParams::default());
        let burst = extractor.extract(&spike_window(), &WindowParams::default());

        // With no viscosity the Hamiltonian is half the normalized rate.
        assert!((quiet.get(Feature::Hamiltonian) - 0.05).abs() < 1e-12);
        assert!((burst.get(Feature::Hamiltonian) - 0.25).abs() < 1e-12);
        let ratio = burst.get(Feature::Hamiltonian) / quiet.get(Feature::Hamiltonian);
        assert!((ratio - 5.0).abs() < 1e-9, "rate ratio {ratio}");

        let quiet = extractor.diagnose(&baseline_window(0), &WindowParams::default());
        let burst = extractor.diagnose(&spike_window(), &WindowParams::default());
        assert!(burst.perceived_throughput > quiet.perceived_throughput);
        assert!(burst.chaos < 0.2);
    }

    #[test]
    fn test_records_serialize_as_json_lines() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        let mut pipeline = Pipeline::from_config(&config(), memory, "json").unwrap();
        let report = pipeline
            .tick_samples(&spike_window(), &WindowParams::default())
            .unwrap();
        let record = report.record.expect("first spike on empty memory decides");
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"label\":\"anomalous\""));
        assert!(line.contains("\"score_a\":null"));
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_tick_poisons_shared_pipeline() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        let pipeline = Pipeline::from_config(&config(), memory, "shared").unwrap();
        let shared = SharedPipeline::new(pipeline);

        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let holder = {
            let shared = shared.clone();
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            std::thread::spawn(move || {
                shared.with(|_| {
                    entered.wait();
                    release.wait();
                    Ok(())
                })
            })
        };

        entered.wait();
        let err = shared.tick(&FeatureVector::zeros(FEATURE_DIM)).unwrap_err();
        release.wait();
        assert!(holder.join().unwrap().is_ok());

        assert!(matches!(err, ShunolloError::ConcurrencyViolation { ref agent } if agent == "shared"));
        assert!(shared.is_poisoned());
        assert!(shared.tick(&FeatureVector::zeros(FEATURE_DIM)).is_err());
    }

    #[test]
    fn test_agents_share_memory() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        let mut a = Pipeline::from_config(&config(), Arc::clone(&memory), "a").unwrap();
        let mut b = Pipeline::from_config(&config(), Arc::clone(&memory), "b").unwrap();

        let v = FeatureVector::new(vec![0.6; FEATURE_DIM]).unwrap();
        assert!(a.tick(&v).unwrap().outcome.remembered);
        assert_eq!(b.tick(&v).unwrap().novelty, 0.0);
    }
}

// ============================================================================
// Offline Work Tests
// ============================================================================

mod offline_tests {
    use super::*;

    #[tokio::test]
    async fn test_consolidation_refits_baseline() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        for i in 0..8 {
            let x = 0.1 + 0.1 * f64::from(i);
            memory
                .remember_baseline(&FeatureVector::new(vec![x; FEATURE_DIM]).unwrap())
                .unwrap();
        }
        let pipeline = Pipeline::from_config(&config(), Arc::clone(&memory), "sleep").unwrap();
        let target = BaselineTarget {
            slot: pipeline.scorer().model_slot(),
            config: pipeline.scorer().config().clone(),
        };

        let config = ConsolidationConfig {
            refit_baseline: true,
            ..Default::default()
        };
        let report = Trainer::new()
            .consolidate(memory, config, Some(target))
            .await
            .unwrap();
        assert_eq!(report.nodes, 8);
        assert!(report.energy_after <= report.energy_before);
        assert!(pipeline.scorer().is_trained());
    }

    #[tokio::test]
    async fn test_default_consolidation_leaves_baseline_alone() {
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        for i in 0..8 {
            let x = 0.1 + 0.1 * f64::from(i);
            memory
                .remember_baseline(&FeatureVector::new(vec![x; FEATURE_DIM]).unwrap())
                .unwrap();
        }
        let pipeline = Pipeline::from_config(&config(), Arc::clone(&memory), "sleep").unwrap();
        let target = BaselineTarget {
            slot: pipeline.scorer().model_slot(),
            config: pipeline.scorer().config().clone(),
        };

        let report = Trainer::new()
            .consolidate(memory, ConsolidationConfig::default(), Some(target))
            .await
            .unwrap();
        assert_eq!(report.nodes, 8);
        assert!(!pipeline.scorer().is_trained());
    }

    #[test]
    fn test_memory_survives_pipeline_restart() {
        let dir = TempDir::new().unwrap();
        let memory_config = MemoryConfig {
            log_path: Some(dir.path().join("episodes.jsonl")),
            ..Default::default()
        };
        let spike = FeatureVector::new(vec![0.9; FEATURE_DIM]).unwrap();
        {
            let memory = Arc::new(EpisodicMemory::from_config(&memory_config).unwrap());
            let mut pipeline = Pipeline::from_config(&config(), memory, "first").unwrap();
            assert!(pipeline.tick(&spike).unwrap().outcome.remembered);
        }
        let memory = Arc::new(EpisodicMemory::from_config(&memory_config).unwrap());
        let mut pipeline = Pipeline::from_config(&config(), memory, "second").unwrap();
        assert_eq!(pipeline.tick(&spike).unwrap().novelty, 0.0);
    }
}
