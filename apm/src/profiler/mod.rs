//! # Thread Profiler
//!
//! Periodic sampling of every live shadow stack, merged into per-category
//! call trees and reported as one compressed payload per session.
//!
//! - `call_tree` - Node arena, merge, pruning and payload encoding
//! - `thread_profiler` - Sampler thread lifecycle and the report

pub mod call_tree;
pub mod thread_profiler;

pub use call_tree::{method_stack, CallForest, MethodData, NodeId, ProfileNode};
pub use thread_profiler::{ProfilerConfig, ThreadProfiler};
