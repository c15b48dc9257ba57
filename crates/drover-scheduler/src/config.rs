use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `[scheduler]` section of `drover.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent dispatches per scope when `start` does not override it.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Sleep after admitting an item.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sleep when nothing is eligible.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Sleep when the scope is at its concurrency ceiling.
    #[serde(default = "default_capacity_interval_ms")]
    pub capacity_interval_ms: u64,
    /// Sleep while the circuit breaker holds the scope paused.
    #[serde(default = "default_paused_interval_ms")]
    pub paused_interval_ms: u64,
    /// Failures inside the window that pause a scope.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Window the failure threshold counts over.
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Resume provider sessions of items interrupted by a crash.
    #[serde(default = "default_true")]
    pub resume_interrupted: bool,
    /// Model for items that do not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Turn limit passed to every dispatch.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// System prompt passed to every dispatch.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_max_concurrency() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_idle_interval_ms() -> u64 {
    5_000
}
fn default_capacity_interval_ms() -> u64 {
    1_000
}
fn default_paused_interval_ms() -> u64 {
    2_000
}
fn default_failure_threshold() -> usize {
    3
}
fn default_failure_window_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_model() -> String {
    "sonnet".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            capacity_interval_ms: default_capacity_interval_ms(),
            paused_interval_ms: default_paused_interval_ms(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            resume_interrupted: true,
            default_model: default_model(),
            max_turns: None,
            system_prompt: None,
        }
    }
}

impl SchedulerConfig {
    /// `poll_interval_ms` as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `idle_interval_ms` as a duration.
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// `capacity_interval_ms` as a duration.
    pub fn capacity_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_interval_ms)
    }

    /// `paused_interval_ms` as a duration.
    pub fn paused_interval(&self) -> Duration {
        Duration::from_millis(self.paused_interval_ms)
    }

    /// `failure_window_secs` as a duration.
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// Millisecond intervals everywhere, for tests.
    pub fn fast() -> Self {
        Self {
            poll_interval_ms: 5,
            idle_interval_ms: 20,
            capacity_interval_ms: 5,
            paused_interval_ms: 10,
            ..Self::default()
        }
    }
}
