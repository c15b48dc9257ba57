use chrono::{DateTime, Utc};
use drover_core::Scope;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// An admitted, in-flight dispatch.
#[derive(Debug, Clone)]
pub struct RunningEntry {
    /// Admitted item.
    pub work_item_id: String,
    /// Scope whose slot it holds.
    pub scope: Scope,
    /// Admission time.
    pub started_at: DateTime<Utc>,
    /// Fires to stop the dispatch.
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct TrackerState {
    running: HashMap<Scope, Vec<RunningEntry>>,
    capacity: HashMap<Scope, usize>,
}

/// Per-scope registry of in-flight work with a capacity ceiling.
pub struct ConcurrencyTracker {
    default_max: usize,
    state: Mutex<TrackerState>,
}

impl ConcurrencyTracker {
    /// Tracker using `default_max` for scopes without an explicit capacity.
    pub fn new(default_max: usize) -> Self {
        Self {
            default_max: default_max.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Set the ceiling for one scope. Zero is raised to one.
    pub fn set_capacity(&self, scope: &Scope, max: usize) {
        self.state.lock().capacity.insert(scope.clone(), max.max(1));
    }

    /// Ceiling for the scope.
    pub fn capacity(&self, scope: &Scope) -> usize {
        let state = self.state.lock();
        state.capacity.get(scope).copied().unwrap_or(self.default_max)
    }

    /// Admit an item if the scope has room and the item is not already
    /// running anywhere.
    pub fn try_admit(&self, scope: &Scope, work_item_id: &str) -> Option<RunningEntry> {
        let mut state = self.state.lock();
        let max = state.capacity.get(scope).copied().unwrap_or(self.default_max);
        if state
            .running
            .values()
            .flatten()
            .any(|e| e.work_item_id == work_item_id)
        {
            return None;
        }
        let slots = state.running.entry(scope.clone()).or_default();
        if slots.len() >= max {
            return None;
        }
        let entry = RunningEntry {
            work_item_id: work_item_id.to_string(),
            scope: scope.clone(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        };
        slots.push(entry.clone());
        debug_assert!(slots.len() <= max);
        Some(entry)
    }

    /// Remove an admitted entry. Returns false if it was already released.
    pub fn release(&self, entry: &RunningEntry) -> bool {
        let mut state = self.state.lock();
        let Some(slots) = state.running.get_mut(&entry.scope) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|e| e.work_item_id != entry.work_item_id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            state.running.remove(&entry.scope);
        }
        removed
    }

    /// Items in flight for the scope.
    pub fn running_count(&self, scope: &Scope) -> usize {
        self.state.lock().running.get(scope).map_or(0, Vec::len)
    }

    /// Whether the item holds a slot in any scope.
    pub fn is_running(&self, work_item_id: &str) -> bool {
        self.state
            .lock()
            .running
            .values()
            .flatten()
            .any(|e| e.work_item_id == work_item_id)
    }

    /// Ids running in a scope, in admission order.
    pub fn running_ids(&self, scope: &Scope) -> Vec<String> {
        self.state
            .lock()
            .running
            .get(scope)
            .map(|slots| slots.iter().map(|e| e.work_item_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Fire the cancellation token of a running item.
    pub fn cancel(&self, work_item_id: &str) -> bool {
        let state = self.state.lock();
        match state
            .running
            .values()
            .flatten()
            .find(|e| e.work_item_id == work_item_id)
        {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything running in a scope; returns how many were signalled.
    pub fn cancel_scope(&self, scope: &Scope) -> usize {
        let state = self.state.lock();
        let Some(slots) = state.running.get(scope) else {
            return 0;
        };
        for entry in slots {
            entry.cancel.cancel();
        }
        slots.len()
    }
}
