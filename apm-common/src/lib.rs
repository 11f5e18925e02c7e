//! # Collector Contract (Core ↔ Transport)
//!
//! Types shared between the in-process aggregation core (`apm`) and whatever
//! transport talks to the remote collector. The core never sees the wire; it
//! drives a [`Session`] and reacts to the closed set of [`SessionError`]
//! outcomes.
//!
//! ## Key Types
//!
//! - [`Session`] / [`Connector`] - One registered connection and its factory
//! - [`SessionError`] - Restart, disconnect, retry, discard, or unexpected
//! - [`Configuration`] - Collector-supplied settings for one session
//! - [`Settings`] - Local agent settings loaded at startup
//! - [`MetricData`], [`ErrorTrace`], [`SlowSqlTrace`], [`TransactionTrace`],
//!   [`ProfilePayload`] - Harvest payloads

pub mod config;
pub mod errors;
pub mod metrics;
pub mod session;
pub mod transaction;

pub use config::{
    AgentLimits, Configuration, ProfilerSettings, Settings, ThreadProfilerConfig,
    TransactionTracerConfig, UrlRule,
};
pub use errors::{SessionError, SettingsError};
pub use metrics::{MetricData, MetricIds, MetricKey, MetricSpec, TimeStats, ValueMetric};
pub use session::{
    AgentCommandRequest, CommandReply, CommandResults, Connector, ProfilePayload, Session,
};
pub use transaction::{
    ErrorRecord, ErrorTrace, Segment, SlowSqlTrace, SqlNode, TransactionData, TransactionGroup,
    TransactionTrace,
};
