//! # apm - In-Process Telemetry Aggregation Core
//!
//! Collects metrics, traces and thread profiles produced throughout a
//! monitored process, aggregates them in memory, and reports them to a remote
//! collector once per harvest period. Collector outages never reach the
//! monitored application: failed reports are retried a bounded number of
//! times and then discarded.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Monitored Application                     │
//! │   record_transaction()   record_metric()   profile_scope!()    │
//! └──────────┬──────────────────────┬────────────────────┬─────────┘
//!            ▼                      ▼                    ▼
//! ┌────────────────────┐ ┌────────────────────┐ ┌─────────────────┐
//! │ transaction stats  │ │   custom stats     │ │ ThreadRegistry  │
//! │  (StatsEngine)     │ │   (StatsEngine)    │ │ (shadow stacks) │
//! └──────────┬─────────┘ └─────────┬──────────┘ └────────┬────────┘
//!            │ snapshot + reset    │                     │ sample
//!            ▼                     ▼                     ▼
//! ┌────────────────────────────────────────┐   ┌─────────────────┐
//! │        Application::harvest()          │◀──│ ThreadProfiler  │
//! │ samplers · retry/merge/discard · cmds  │   │  (call trees)   │
//! └──────────────────┬─────────────────────┘   └─────────────────┘
//!                    ▼
//!            Session (collector transport, apm_common)
//! ```
//!
//! ## Module Structure
//!
//! - [`application`]: Session lifecycle, recording, harvest cycle
//! - [`commands`]: Collector-issued agent commands and their handlers
//! - [`profiler`]: Sampling thread, call trees, pruning, payload encoding
//! - [`stack`]: Shadow-stack capture consumed by the profiler
//! - [`stats`]: The metric aggregator behind the application's locks
//! - [`rules`]: Transaction name normalization from collector URL rules
//! - [`samplers`]: Per-harvest value metric producers
//! - [`internal`]: Supportability metrics about the agent itself
//! - [`loopback`]: Logging collector stand-in used by the demo binary
//! - [`cli`]: Demo binary arguments
//! - [`domain`]: Core types and error enums
//!
//! ## Typical Usage
//!
//! ```ignore
//! let app = Arc::new(Application::new(settings, connector, ThreadRegistry::global()));
//! app.activate_session();
//! app.wait_for_session_activation(Duration::from_secs(5));
//!
//! app.record_transaction(&data);     // from any thread
//! app.harvest(false);                // from a timer, once per period
//! app.harvest(true);                 // once, at process exit
//! ```

pub mod application;
pub mod cli;
pub mod commands;
pub mod domain;
pub mod internal;
pub mod loopback;
pub mod profiler;
pub mod rules;
pub mod samplers;
pub mod stack;
pub mod stats;
mod sync;

pub use application::Application;
