//! Pipeline Configuration Module
//!
//! ## Loading Order
//!
//! 1. `STIX_PIPELINE_CONFIG` environment variable (path to TOML file)
//! 2. `pipeline.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded config is handed to whoever needs it; there is no global.

mod pipeline_config;
pub mod defaults;
pub mod validation;

pub use pipeline_config::*;
