//! Domain model for the agent core
//!
//! Core types and errors shared across the harvest and profiling pipelines.

pub mod errors;
pub mod types;

pub use types::{now_secs, ThreadCategory};

pub use errors::{ProfileError, RulesError, StatsError};
