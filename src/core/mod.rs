//! Core types and constants for the fusion pipeline

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
