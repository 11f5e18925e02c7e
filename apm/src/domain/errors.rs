//! Structured error types for the agent core
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

/// Failure while folding a transaction into an aggregator.
#[derive(Error, Debug, PartialEq)]
pub enum StatsError {
    #[error("Transaction {name} ends before it starts ({start} > {end})")]
    NegativeDuration { name: String, start: f64, end: f64 },

    #[error("Transaction {name} has a non-finite timing value")]
    NonFiniteTiming { name: String },

    #[error("Aggregator has no configuration")]
    Unconfigured,
}

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Invalid URL rule pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to serialize profile tree: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to compress profile data: {0}")]
    Compression(#[from] std::io::Error),
}
