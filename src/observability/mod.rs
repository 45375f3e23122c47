//! Observability module
//!
//! Structured logging setup and span helpers for ticks and training jobs.

pub mod telemetry;
