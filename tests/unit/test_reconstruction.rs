//! Unit tests for the reconstruction scorer

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shunollo::config::{ConsolidationConfig, ReconstructionConfig};
use shunollo::errors::{InputValidationError, ShunolloError, TrainingError};
use shunollo::features::{FeatureVector, FEATURE_DIM};
use shunollo::memory::EpisodicMemory;
use shunollo::reconstruction::{BaselineModel, ReconstructionScorer};
use shunollo::training::{BaselineTarget, CancelToken, Trainer};

/// Vectors near a two-dimensional plane through the middle of the hypercube.
fn baseline_batch(n: usize, seed: u64) -> Vec<FeatureVector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let a: f64 = rng.random_range(-0.2..0.2);
            let b: f64 = rng.random_range(-0.2..0.2);
            let values = (0..FEATURE_DIM)
                .map(|i| {
                    let dir = if i % 2 == 0 { a } else { b };
                    0.5 + dir + rng.random_range(-0.005..0.005)
                })
                .collect();
            FeatureVector::new(values).unwrap()
        })
        .collect()
}

fn off_plane(seed: u64) -> Vec<FeatureVector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..20)
        .map(|_| {
            FeatureVector::new((0..FEATURE_DIM).map(|_| rng.random_range(0.0..1.0)).collect())
                .unwrap()
        })
        .collect()
}

fn mean_score(scorer: &ReconstructionScorer, batch: &[FeatureVector]) -> f64 {
    batch.iter().map(|v| scorer.score(v).unwrap()).sum::<f64>() / batch.len() as f64
}

// ============================================================================
// Scorer Tests
// ============================================================================

mod scorer_tests {
    use super::*;

    #[test]
    fn test_baseline_scores_lower_than_unseen() {
        let scorer = ReconstructionScorer::new(ReconstructionConfig::default()).unwrap();
        scorer.train_baseline(&baseline_batch(200, 1)).unwrap();
        let seen = mean_score(&scorer, &baseline_batch(20, 2));
        let unseen = mean_score(&scorer, &off_plane(3));
        assert!(seen < unseen, "seen {seen} vs unseen {unseen}");
        assert!(seen < 1e-3);
    }

    #[test]
    fn test_untrained_scorer_errors() {
        let scorer = ReconstructionScorer::new(ReconstructionConfig::default()).unwrap();
        let err = scorer.score(&FeatureVector::zeros(FEATURE_DIM)).unwrap_err();
        assert!(matches!(
            err,
            ShunolloError::UntrainedModel {
                model: "reconstruction"
            }
        ));
    }

    #[test]
    fn test_batch_size_errors() {
        let config = ReconstructionConfig::default();
        let cancel = CancelToken::new();
        assert!(matches!(
            BaselineModel::fit(&[], &config, &cancel),
            Err(ShunolloError::InputValidation(InputValidationError::EmptyBatch))
        ));
        assert!(matches!(
            BaselineModel::fit(&baseline_batch(1, 4), &config, &cancel),
            Err(ShunolloError::Training(TrainingError::InsufficientData { .. }))
        ));
    }

    #[test]
    fn test_latent_dimension_respects_bottleneck() {
        let model = BaselineModel::fit(
            &baseline_batch(100, 5),
            &ReconstructionConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(model.latent_dimension() <= 4);
        assert_eq!(model.dimension(), FEATURE_DIM);
        assert_eq!(model.trained_on(), 100);
    }
}

// ============================================================================
// Background Training Tests
// ============================================================================

mod trainer_tests {
    use super::*;

    #[tokio::test]
    async fn test_trainer_swaps_baseline_in() {
        let scorer = ReconstructionScorer::new(ReconstructionConfig::default()).unwrap();
        let target = BaselineTarget {
            slot: scorer.model_slot(),
            config: scorer.config().clone(),
        };
        assert!(!scorer.is_trained());
        Trainer::new()
            .train_baseline(target, baseline_batch(50, 6))
            .await
            .unwrap();
        assert!(scorer.is_trained());
    }

    fn refit_config() -> ConsolidationConfig {
        ConsolidationConfig {
            refit_baseline: true,
            ..Default::default()
        }
    }

    fn target(scorer: &ReconstructionScorer) -> BaselineTarget {
        BaselineTarget {
            slot: scorer.model_slot(),
            config: scorer.config().clone(),
        }
    }

    #[tokio::test]
    async fn test_remembered_anomalies_survive_consolidation() {
        let scorer = ReconstructionScorer::new(ReconstructionConfig::default()).unwrap();
        scorer.train_baseline(&baseline_batch(40, 7)).unwrap();

        // Memory is mostly novel episodes, as it is after a noisy stretch.
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        for v in baseline_batch(2, 8) {
            memory.remember_baseline(&v).unwrap();
        }
        let anomalies: Vec<FeatureVector> = off_plane(9).into_iter().take(6).collect();
        for v in &anomalies {
            memory.remember(v).unwrap();
        }
        let before = mean_score(&scorer, &anomalies);

        let trainer = Trainer::new();
        for config in [ConsolidationConfig::default(), refit_config()] {
            let report = trainer
                .consolidate(Arc::clone(&memory), config, Some(target(&scorer)))
                .await
                .unwrap();
            assert_eq!(report.nodes, 8);
        }

        assert_eq!(scorer.model_slot().load().unwrap().trained_on(), 40);
        let after = mean_score(&scorer, &anomalies);
        assert_eq!(after, before);
        assert!(after > 10.0 * mean_score(&scorer, &baseline_batch(20, 10)));
    }

    #[tokio::test]
    async fn test_refit_uses_only_baseline_exemplars() {
        let scorer = ReconstructionScorer::new(ReconstructionConfig::default()).unwrap();
        let memory = Arc::new(EpisodicMemory::in_memory(FEATURE_DIM));
        for v in baseline_batch(8, 11) {
            memory.remember_baseline(&v).unwrap();
        }
        let anomalies: Vec<FeatureVector> = off_plane(12).into_iter().take(6).collect();
        for v in &anomalies {
            memory.remember(v).unwrap();
        }

        Trainer::new()
            .consolidate(memory, refit_config(), Some(target(&scorer)))
            .await
            .unwrap();

        assert_eq!(scorer.model_slot().load().unwrap().trained_on(), 8);
        let normal = mean_score(&scorer, &baseline_batch(20, 13));
        let novel = mean_score(&scorer, &anomalies);
        assert!(novel > 10.0 * normal, "novel {novel} vs normal {normal}");
    }
}
