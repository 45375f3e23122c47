use std::path::PathBuf;
use thiserror::Error;

/// The central error type for the shunollo pipeline.
///
/// Each component reports its own concern through a sub-enum; the CLI maps
/// the top-level variants onto process exit codes.
#[derive(Error, Debug)]
pub enum ShunolloError {
    #[error("Input validation failed: {0}")]
    InputValidation(#[from] InputValidationError),

    #[error("Model '{model}' has not been trained")]
    UntrainedModel { model: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Concurrent mutation detected on agent '{agent}'")]
    ConcurrencyViolation { agent: String },

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Agent halted: {reason}")]
    AgentHalted { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputValidationError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Non-finite value {value} at index {index}")]
    NonFinite { index: usize, value: f64 },

    #[error("Value {value} at index {index} outside [{min}, {max}]")]
    OutOfRange {
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    #[error("Non-finite or negative {field}: {value}")]
    InvalidScalar { field: &'static str, value: f64 },

    #[error("Batch is empty")]
    EmptyBatch,

    #[error("Label count {labels} does not match sample count {samples}")]
    LabelCountMismatch { samples: usize, labels: usize },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Corrupt record at line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    #[error("Failed to serialize episode: {0}")]
    Serialize(String),

    #[error("Episode writer is no longer running")]
    WriterClosed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("Training cancelled")]
    Cancelled,

    #[error("Insufficient training data: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Normal equations are not positive definite (pivot {pivot})")]
    Singular { pivot: usize },

    #[error("Background training task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ShunolloError>;

impl ShunolloError {
    /// Whether the error leaves the owning agent unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShunolloError::ConcurrencyViolation { .. } | ShunolloError::AgentHalted { .. }
        )
    }
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INPUT_ERROR: u8 = 3;
pub const EXIT_STORAGE_ERROR: u8 = 4;
pub const EXIT_HALTED: u8 = 5;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<ShunolloError>() {
        return match err {
            ShunolloError::Config(_) => EXIT_CONFIG_ERROR,
            ShunolloError::InputValidation(_) => EXIT_INPUT_ERROR,
            ShunolloError::Storage(_) => EXIT_STORAGE_ERROR,
            ShunolloError::AgentHalted { .. } | ShunolloError::ConcurrencyViolation { .. } => {
                EXIT_HALTED
            }
            _ => EXIT_ERROR,
        };
    }

    // Direct enum unwraps fallback
    if e.downcast_ref::<InputValidationError>().is_some() {
        return EXIT_INPUT_ERROR;
    }
    if e.downcast_ref::<StorageError>().is_some() {
        return EXIT_STORAGE_ERROR;
    }

    EXIT_ERROR
}
