//! Autonomous scheduling for Drover.
//!
//! Orders work items by dependency, admits them under a per-scope
//! concurrency ceiling, dispatches them to AI providers and pauses a scope
//! when too many dispatches fail in a short window.
//!
//! # Main types
//!
//! - [`Scheduler`] — The polling loop and its control operations.
//! - [`ConcurrencyTracker`] — Per-scope admission with a capacity ceiling.
//! - [`CircuitBreaker`] — Sliding-window failure counter.
//! - [`SnapshotStore`] — Crash-recovery snapshots on disk.
//! - [`WorkItemStore`] — Where work items come from.

/// The scheduling loop.
pub mod auto_loop;
/// Failure circuit breaker.
pub mod breaker;
/// Per-scope admission control.
pub mod concurrency;
/// `[scheduler]` configuration.
pub mod config;
/// Kahn ordering over work-item dependencies.
pub mod resolver;
/// Execution-state snapshots.
pub mod snapshot;
/// Work-item store interface and implementations.
pub mod store;

pub use auto_loop::{LoopPhase, LoopStatus, RecoveryReport, Scheduler, SchedulerDeps};
pub use breaker::{BreakerDecision, CircuitBreaker};
pub use concurrency::{ConcurrencyTracker, RunningEntry};
pub use config::SchedulerConfig;
pub use resolver::{
    blocking_dependencies, dependencies_satisfied, resolve_dependencies, MissingDependency,
    Resolution,
};
pub use snapshot::{ExecutionStateSnapshot, SnapshotStore, SNAPSHOT_VERSION};
pub use store::{InMemoryWorkItemStore, JsonFileWorkItemStore, WorkItemStore};
