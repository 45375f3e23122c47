//! Unit tests for episodic memory
//!
//! Tests cover:
//! - Novelty on empty and repeated input
//! - Recall ordering
//! - JSONL persistence, corrupt records and schema mismatches
//! - Write-behind flushing and baseline tags
//! - Offline consolidation

use chrono::{Duration, Utc};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

use shunollo::config::{ConsolidationConfig, MemoryConfig};
use shunollo::errors::{InputValidationError, ShunolloError};
use shunollo::features::{FeatureVector, FEATURE_DIM};
use shunollo::memory::consolidation::consolidate;
use shunollo::memory::{Episode, EpisodeLog, EpisodicMemory, JsonlEpisodeLog, MAX_NOVELTY};
use shunollo::training::CancelToken;

fn constant(x: f64) -> FeatureVector {
    FeatureVector::new(vec![x; FEATURE_DIM]).unwrap()
}

fn log_in(dir: &TempDir) -> Arc<JsonlEpisodeLog> {
    Arc::new(JsonlEpisodeLog::new(dir.path().join("episodes.jsonl")))
}

// ============================================================================
// Recall Tests
// ============================================================================

mod recall_tests {
    use super::*;

    #[test]
    fn test_repeated_vector_novelty() {
        let memory = EpisodicMemory::in_memory(FEATURE_DIM);
        let v = constant(0.3);
        assert_eq!(memory.novelty(&v).unwrap(), MAX_NOVELTY);
        memory.remember(&v).unwrap();
        assert_eq!(memory.novelty(&v).unwrap(), 0.0);
    }

    #[test]
    fn test_recall_sorted_and_truncated() {
        let memory = EpisodicMemory::in_memory(FEATURE_DIM);
        for x in [0.9, 0.1, 0.5, 0.3] {
            memory.remember(&constant(x)).unwrap();
        }
        let hits = memory.recall_similar(&constant(0.0), 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(hits[0].0.vector.values()[0], 0.1);
        assert!(memory.recall_similar(&constant(0.0), 0).unwrap().is_empty());
    }

    #[test]
    fn test_recall_within_radius() {
        let memory = EpisodicMemory::in_memory(FEATURE_DIM);
        memory.remember(&constant(0.1)).unwrap();
        memory.remember(&constant(0.9)).unwrap();
        let near = memory.recall_within(&constant(0.0), 5, 1.0).unwrap();
        assert_eq!(near.len(), 1);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let memory = EpisodicMemory::in_memory(FEATURE_DIM);
        let err = memory.remember(&FeatureVector::zeros(3)).unwrap_err();
        assert!(matches!(
            err,
            ShunolloError::InputValidation(InputValidationError::DimensionMismatch { .. })
        ));
        assert!(memory.is_empty());
    }

    #[test]
    fn test_prune_keeps_recent() {
        let memory = EpisodicMemory::in_memory(FEATURE_DIM);
        memory.remember(&constant(0.2)).unwrap();
        assert_eq!(memory.prune_older_than(Utc::now() - Duration::hours(1)), 0);
        assert_eq!(memory.prune_older_than(Utc::now() + Duration::seconds(1)), 1);
        assert!(memory.is_empty());
    }
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence_tests {
    use super::*;

    #[test]
    fn test_reopen_restores_episodes() {
        let dir = TempDir::new().unwrap();
        {
            let memory = EpisodicMemory::open(log_in(&dir), FEATURE_DIM, false).unwrap();
            memory.remember(&constant(0.2)).unwrap();
            memory.remember(&constant(0.7)).unwrap();
        }
        let memory = EpisodicMemory::open(log_in(&dir), FEATURE_DIM, false).unwrap();
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.novelty(&constant(0.7)).unwrap(), 0.0);
    }

    #[test]
    fn test_corrupt_records_skipped() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.append(&Episode::new(constant(0.4))).unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(log.path())
                .unwrap();
            writeln!(file, "{{\"sha256\":\"00\",\"episode\":{{}}}}").unwrap();
            writeln!(file, "garbage").unwrap();
        }
        log.append(&Episode::new(constant(0.6))).unwrap();

        let memory = EpisodicMemory::open(log_in(&dir), FEATURE_DIM, false).unwrap();
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.stats().skipped_records, 2);
    }

    #[test]
    fn test_torn_tail_does_not_swallow_next_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("episodes.jsonl");
        std::fs::write(&path, "{\"sha256\":\"ab").unwrap();

        let memory =
            EpisodicMemory::open(Arc::new(JsonlEpisodeLog::new(&path)), FEATURE_DIM, false)
                .unwrap();
        assert_eq!(memory.stats().skipped_records, 1);
        memory.remember(&constant(0.5)).unwrap();

        let reopened =
            EpisodicMemory::open(Arc::new(JsonlEpisodeLog::new(&path)), FEATURE_DIM, false)
                .unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_fails_open() {
        let dir = TempDir::new().unwrap();
        log_in(&dir)
            .append(&Episode::new(FeatureVector::zeros(4)))
            .unwrap();
        let err = EpisodicMemory::open(log_in(&dir), FEATURE_DIM, false).unwrap_err();
        assert!(matches!(err, ShunolloError::InputValidation(_)));
    }

    #[test]
    fn test_write_behind_flush_persists() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig {
            log_path: Some(dir.path().join("wb.jsonl")),
            write_behind: true,
            ..Default::default()
        };
        {
            let memory = EpisodicMemory::from_config(&config).unwrap();
            for i in 0..20 {
                memory.remember(&constant(f64::from(i) / 20.0)).unwrap();
            }
            memory.flush().unwrap();
            assert_eq!(memory.stats().failed_appends, 0);
        }
        let memory = EpisodicMemory::from_config(&config).unwrap();
        assert_eq!(memory.len(), 20);
    }

    #[test]
    fn test_baseline_tag_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig {
            log_path: Some(dir.path().join("tagged.jsonl")),
            ..Default::default()
        };
        {
            let memory = EpisodicMemory::from_config(&config).unwrap();
            memory.remember_baseline(&constant(0.3)).unwrap();
            memory.remember(&constant(0.9)).unwrap();
        }
        let memory = EpisodicMemory::from_config(&config).unwrap();
        let episodes = memory.snapshot();
        assert_eq!(episodes.len(), 2);
        assert!(episodes[0].baseline);
        assert!(!episodes[1].baseline);
        assert_eq!(memory.stats().baseline_episodes, 1);
    }

    #[test]
    fn test_untagged_payload_reads_as_novel() {
        let mut value = serde_json::to_value(Episode::new(constant(0.5))).unwrap();
        value.as_object_mut().unwrap().remove("baseline");
        let episode: Episode = serde_json::from_value(value).unwrap();
        assert!(!episode.baseline);
    }
}

// ============================================================================
// Consolidation Tests
// ============================================================================

mod consolidation_tests {
    use super::*;

    #[test]
    fn test_consolidation_lowers_energy() {
        let start = Utc::now();
        let episodes: Vec<Episode> = [0.2, 0.8, 0.3, 0.7]
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                Episode::new(constant(x)).with_recorded_at(start + Duration::seconds(i as i64))
            })
            .collect();
        let report =
            consolidate(&episodes, &ConsolidationConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(report.nodes, 4);
        assert_eq!(report.refined.len(), 4);
        assert!(report.energy_after <= report.energy_before);
        assert!(report
            .refined
            .iter()
            .all(|v| v.values().iter().all(|x| (0.0..=1.0).contains(x))));
    }

    #[test]
    fn test_cancelled_consolidation_reports_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let episodes = vec![Episode::new(constant(0.1)), Episode::new(constant(0.9))];
        assert!(consolidate(&episodes, &ConsolidationConfig::default(), &token).is_err());
    }
}
