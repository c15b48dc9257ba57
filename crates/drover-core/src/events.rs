use crate::message::ProviderMessage;
use crate::work_item::Scope;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Lifecycle events announced by the scheduling loop.
///
/// The payloads are relayed verbatim to remote listeners by an external
/// transport, so the serialized shape is part of the public contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A scope's loop began polling.
    LoopStarted {
        scope: Scope,
        /// Ceiling in effect for this run.
        max_concurrency: usize,
    },
    /// The loop was stopped and its dispatches settled.
    LoopStopped {
        scope: Scope,
    },
    /// Nothing is eligible to run and nothing is running.
    LoopIdle {
        scope: Scope,
    },
    /// The circuit breaker halted admissions for the scope.
    LoopPaused {
        scope: Scope,
        failure_count: usize,
        reason: String,
    },
    /// An operator lifted a circuit-breaker pause.
    LoopResumed {
        scope: Scope,
    },
    /// An admitted item was handed to a provider.
    DispatchStarted {
        scope: Scope,
        work_item_id: String,
        /// Registry name of the backend.
        provider: String,
        /// Model with any provider prefix stripped.
        model: String,
    },
    /// A normalized provider message relayed while the dispatch runs.
    DispatchMessage {
        scope: Scope,
        work_item_id: String,
        message: ProviderMessage,
    },
    /// The provider reported success.
    DispatchCompleted {
        scope: Scope,
        work_item_id: String,
        /// Final result text, or a summary of the agent's output.
        summary: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// The dispatch failed; counted by the circuit breaker.
    DispatchError {
        scope: Scope,
        work_item_id: String,
        error: String,
        duration_ms: u64,
    },
    /// An item cannot be ordered (dependency cycle or missing dependency).
    DependencyBlocked {
        scope: Scope,
        work_item_id: String,
        reason: String,
    },
}

impl SchedulerEvent {
    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::LoopStarted { .. } => "loop_started",
            SchedulerEvent::LoopStopped { .. } => "loop_stopped",
            SchedulerEvent::LoopIdle { .. } => "loop_idle",
            SchedulerEvent::LoopPaused { .. } => "loop_paused",
            SchedulerEvent::LoopResumed { .. } => "loop_resumed",
            SchedulerEvent::DispatchStarted { .. } => "dispatch_started",
            SchedulerEvent::DispatchMessage { .. } => "dispatch_message",
            SchedulerEvent::DispatchCompleted { .. } => "dispatch_completed",
            SchedulerEvent::DispatchError { .. } => "dispatch_error",
            SchedulerEvent::DependencyBlocked { .. } => "dependency_blocked",
        }
    }

    /// Scope the event belongs to.
    pub fn scope(&self) -> &Scope {
        match self {
            SchedulerEvent::LoopStarted { scope, .. }
            | SchedulerEvent::LoopStopped { scope }
            | SchedulerEvent::LoopIdle { scope }
            | SchedulerEvent::LoopPaused { scope, .. }
            | SchedulerEvent::LoopResumed { scope }
            | SchedulerEvent::DispatchStarted { scope, .. }
            | SchedulerEvent::DispatchMessage { scope, .. }
            | SchedulerEvent::DispatchCompleted { scope, .. }
            | SchedulerEvent::DispatchError { scope, .. }
            | SchedulerEvent::DependencyBlocked { scope, .. } => scope,
        }
    }

    /// Work item the event concerns, if any.
    pub fn work_item_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::DispatchStarted { work_item_id, .. }
            | SchedulerEvent::DispatchMessage { work_item_id, .. }
            | SchedulerEvent::DispatchCompleted { work_item_id, .. }
            | SchedulerEvent::DispatchError { work_item_id, .. }
            | SchedulerEvent::DependencyBlocked { work_item_id, .. } => Some(work_item_id),
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Callback)>>,
}

/// Synchronous in-process publish/subscribe.
///
/// Delivery is best-effort: an event reaches the subscribers registered at the
/// moment [`EventBus::emit`] is called, and nothing is buffered. Cloning the bus
/// is cheap and every clone shares the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// An empty bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Process-wide bus, for callers that cannot have one injected.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Register a callback. It stays registered until the returned handle's
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every current subscriber with the event.
    pub fn emit(&self, event: SchedulerEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking or
        // disturbing this delivery round.
        let subscribers: Vec<Callback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        tracing::trace!(event = event.kind(), subscribers = subscribers.len(), "emit");
        for cb in subscribers {
            cb(&event);
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the callback. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn idle() -> SchedulerEvent {
        SchedulerEvent::LoopIdle {
            scope: Scope::new("/p"),
        }
    }

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            let _ = bus.subscribe(move |e| seen.lock().push(format!("{tag}:{}", e.kind())));
        }
        bus.emit(idle());
        assert_eq!(*seen.lock(), vec!["a:loop_idle", "b:loop_idle"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let sub = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(idle());
        sub.unsubscribe();
        sub.unsubscribe();
        bus.emit(idle());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_during_emit_does_not_skip_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let s = seen.clone();
        let slot_in = slot.clone();
        let first = bus.subscribe(move |_| {
            s.lock().push("first");
            if let Some(sub) = slot_in.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(first);

        let s = seen.clone();
        let _second = bus.subscribe(move |_| s.lock().push("second"));

        bus.emit(idle());
        bus.emit(idle());
        assert_eq!(*seen.lock(), vec!["first", "second", "second"]);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = SchedulerEvent::DispatchStarted {
            scope: Scope::with_branch("/p", "main"),
            work_item_id: "f1".into(),
            provider: "claude".into(),
            model: "sonnet".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "dispatch_started");
        assert_eq!(json["work_item_id"], "f1");
        assert_eq!(json["scope"]["branch"], "main");
        assert_eq!(event.work_item_id(), Some("f1"));
    }

    #[test]
    fn test_global_bus_is_shared() {
        let a = EventBus::global().clone();
        let sub = a.subscribe(|_| {});
        assert!(EventBus::global().subscriber_count() >= 1);
        sub.unsubscribe();
    }
}
