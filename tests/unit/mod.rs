//! Unit tests for shunollo modules
//!
//! These tests drive components through the public API only. Anything
//! touching disk uses a temporary directory.

mod test_config;
mod test_decision;
mod test_features;
mod test_memory;
mod test_pipeline;
mod test_reconstruction;
mod test_reservoir;
