//! Unit tests for the config module
//!
//! Tests cover:
//! - Defaults
//! - TOML parsing with partial sections
//! - Validation failures and exit codes

use std::io::Write;
use tempfile::NamedTempFile;

use shunollo::config::{Config, DecisionConfig, ReservoirConfig};
use shunollo::errors::{get_exit_code, ShunolloError, EXIT_CONFIG_ERROR};
use shunollo::features::FEATURE_DIM;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// ============================================================================
// Default Tests
// ============================================================================

mod default_tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_memory_writes_behind_and_refit_is_opt_in() {
        let c = Config::default();
        assert!(c.memory.write_behind);
        assert!(!c.consolidation.refit_baseline);

        let parsed: Config = toml::from_str("[memory]\nrecall_k = 3\n").unwrap();
        assert!(parsed.memory.write_behind);
        assert!(!parsed.consolidation.refit_baseline);
    }

    #[test]
    fn test_sections_share_canonical_dimension() {
        let c = Config::default();
        assert_eq!(c.memory.dimension, FEATURE_DIM);
        assert_eq!(c.reservoir.input_dimension, FEATURE_DIM);
        assert_eq!(c.reconstruction.dimension, FEATURE_DIM);
        assert_eq!(c.decision.dimension, FEATURE_DIM);
    }

    #[test]
    fn test_decision_defaults_bound_latency() {
        let d = DecisionConfig::default();
        assert_eq!(d.threshold, 1.0);
        assert_eq!(d.threshold_decay, 0.1);
        assert_eq!(d.threshold_floor, 0.1);
    }
}

// ============================================================================
// Loading Tests
// ============================================================================

mod loading_tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let file = write_config(
            r#"
[reservoir]
hidden_size = 128
spectral_radius = 0.9

[decision]
novelty_threshold = 0.75
"#,
        );
        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.reservoir.hidden_size, 128);
        assert_eq!(config.reservoir.spectral_radius, 0.9);
        assert_eq!(config.reservoir.leak_rate, ReservoirConfig::default().leak_rate);
        assert_eq!(config.decision.novelty_threshold, 0.75);
        assert_eq!(config.memory.recall_k, 5);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let file = write_config("[reservoir]\nspectral_radius = 1.2\n");
        let err = Config::load(file.path().to_str()).unwrap_err();
        assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_mismatched_dimensions_rejected() {
        let mut config = Config::default();
        config.reconstruction.dimension = 8;
        assert!(matches!(config.validate(), Err(ShunolloError::Config(_))));
    }

    #[test]
    fn test_agreeing_non_canonical_dimension_rejected() {
        let mut config = Config::default();
        config.memory.dimension = FEATURE_DIM + 2;
        config.reservoir.input_dimension = FEATURE_DIM + 2;
        config.reconstruction.dimension = FEATURE_DIM + 2;
        config.decision.dimension = FEATURE_DIM + 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ShunolloError::Config(_)));
        assert!(err.to_string().contains("canonical fingerprint size"));
    }

    #[test]
    fn test_non_canonical_dimension_in_file_rejected() {
        let file = write_config(
            "[memory]\ndimension = 18\n[reservoir]\ninput_dimension = 18\n\
             [reconstruction]\ndimension = 18\n[decision]\ndimension = 18\n",
        );
        let err = Config::load(file.path().to_str()).unwrap_err();
        assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load(Some("/nonexistent/shunollo.toml")).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let original = Config::default();
        let rendered = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.decision, original.decision);
        assert_eq!(parsed.reservoir, original.reservoir);
    }
}
