//! Core types and error definitions for the Drover agent scheduler.
//!
//! This crate provides the foundational types shared across all Drover crates:
//! the provider message model every backend speaks, per-dispatch execution
//! options, schedulable work items, and the in-process event bus.
//!
//! # Main types
//!
//! - [`DroverError`] — Unified error enum for all Drover subsystems.
//! - [`DroverResult`] — Convenience alias for `Result<T, DroverError>`.
//! - [`ProviderMessage`] — The uniform streaming output of every provider.
//! - [`ExecuteOptions`] — Immutable configuration for a single dispatch.
//! - [`WorkItem`] — A schedulable unit of agent work.
//! - [`Scope`] — Project (and optional branch) under which limits are tracked.
//! - [`EventBus`] — Synchronous publish/subscribe for lifecycle events.

/// In-process publish/subscribe for scheduler lifecycle events.
pub mod events;
/// The tagged-union wire format shared by every provider backend.
pub mod message;
/// Per-dispatch execution options.
pub mod options;
/// Work items, statuses, and scheduling scopes.
pub mod work_item;

pub use events::{EventBus, SchedulerEvent, Subscription};
pub use message::{ContentBlock, ProviderMessage, ResultSubtype, Role};
pub use options::{
    ExecuteOptions, HistoryMessage, McpServerConfig, PromptContent, ReasoningEffort,
    ThinkingLevel,
};
pub use work_item::{Scope, WorkItem, WorkItemStatus};

// --- Error types ---

/// Top-level error type for the Drover scheduler.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    /// A provider adapter failed outside of its message stream.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The backend binary or SDK for a provider could not be found.
    #[error("Provider '{provider}' is not installed")]
    NotInstalled {
        /// Name of the provider that is missing.
        provider: String,
    },

    /// The backend is installed but has no usable credentials.
    #[error("Provider '{provider}' is not authenticated")]
    NotAuthenticated {
        /// Name of the provider lacking credentials.
        provider: String,
    },

    /// A child process exited unsuccessfully before producing a terminal event.
    #[error("Process '{program}' failed (exit {}): {stderr}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Process {
        /// Program that was spawned.
        program: String,
        /// Exit code, or `None` when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the external work-item store.
    #[error("Store error: {0}")]
    Store(String),

    /// An error raised by the scheduling loop.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error reading or writing execution-state snapshots.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DroverError`].
pub type DroverResult<T> = Result<T, DroverError>;
