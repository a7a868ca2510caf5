//! Configuration loading and validation

pub mod config;

pub use config::{ConfigError, ConfigurationManager, TrackingConfig};
