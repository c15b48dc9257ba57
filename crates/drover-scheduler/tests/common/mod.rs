//! Shared fixtures: a scripted provider and scheduler wiring.

#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use drover_core::{
    DroverError, DroverResult, EventBus, ExecuteOptions, ProviderMessage, SchedulerEvent, WorkItem,
};
use drover_providers::{
    InstallationStatus, ModelDefinition, Provider, ProviderRegistration, ProviderRegistry,
    ProviderStream,
};
use drover_scheduler::{
    InMemoryWorkItemStore, Scheduler, SchedulerConfig, SchedulerDeps, SnapshotStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the provider answers a prompt.
#[derive(Clone)]
pub enum Script {
    /// Yield these messages, pausing `delay` before each.
    Messages {
        messages: Vec<ProviderMessage>,
        delay: Duration,
    },
    /// Run until cancelled, then end without a terminal message.
    Hang,
    /// Refuse to start.
    SetupError(String),
}

impl Script {
    pub fn success(text: &str) -> Self {
        Script::Messages {
            messages: vec![
                ProviderMessage::assistant_text(text),
                ProviderMessage::success(Some(text.to_string()), Some(format!("sess-{text}"))),
            ],
            delay: Duration::from_millis(5),
        }
    }

    pub fn slow_success(text: &str, delay: Duration) -> Self {
        match Script::success(text) {
            Script::Messages { messages, .. } => Script::Messages { messages, delay },
            other => other,
        }
    }

    pub fn failure(error: &str) -> Self {
        Script::Messages {
            messages: vec![ProviderMessage::error(error, None)],
            delay: Duration::from_millis(1),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provider whose answers are keyed by the work item title that opens the prompt.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, Script>>,
    fallback: Script,
    supports_resume: bool,
    pub calls: Mutex<Vec<ExecuteOptions>>,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            supports_resume: true,
            calls: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script(self, title: &str, script: Script) -> Self {
        self.scripts.lock().insert(title.to_string(), script);
        self
    }

    pub fn without_resume(mut self) -> Self {
        self.supports_resume = false;
        self
    }

    /// Titles in the order they were dispatched.
    pub fn dispatched(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|o| o.prompt.as_text().lines().next().unwrap_or_default().to_string())
            .collect()
    }

    fn script_for(&self, prompt: &str) -> Script {
        let title = prompt.lines().next().unwrap_or_default();
        self.scripts
            .lock()
            .get(title)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn detect_installation(&self) -> InstallationStatus {
        InstallationStatus {
            installed: true,
            authenticated: true,
            ..InstallationStatus::default()
        }
    }

    fn available_models(&self) -> Vec<ModelDefinition> {
        vec![ModelDefinition::new("scripted", "scripted-1", "Scripted", "test double").as_default()]
    }

    fn supports_resume(&self) -> bool {
        self.supports_resume
    }

    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream> {
        let script = self.script_for(&options.prompt.as_text());
        let cancel = options.cancel.clone();
        self.calls.lock().push(options);

        let (messages, delay) = match script {
            Script::SetupError(msg) => return Err(DroverError::Provider(msg)),
            Script::Hang => (Vec::new(), None),
            Script::Messages { messages, delay } => (messages, Some(delay)),
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            match delay {
                None => cancel.cancelled().await,
                Some(delay) => {
                    for message in messages {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        yield message;
                    }
                }
            }
        }))
    }
}

/// Registry with the scripted provider as its only backend.
pub fn registry_with(provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
    let registry = ProviderRegistry::builder()
        .register(
            ProviderRegistration::new("scripted", |_| true, move || provider.clone() as Arc<dyn Provider>)
                .with_prefix("scripted-"),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

/// Events captured from a bus.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl Recorder {
    pub fn attach(bus: &EventBus) -> Self {
        let recorder = Recorder::default();
        let sink = recorder.events.clone();
        bus.subscribe(move |e| sink.lock().push(e.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Work item ids of events of one kind, in emission order.
    pub fn ids(&self, kind: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .filter_map(|e| e.work_item_id().map(String::from))
            .collect()
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub store: Arc<InMemoryWorkItemStore>,
    pub recorder: Recorder,
    pub bus: EventBus,
}

pub fn harness(
    project: &Path,
    items: Vec<WorkItem>,
    registry: Arc<ProviderRegistry>,
    state_dir: &Path,
    config: SchedulerConfig,
) -> Harness {
    let store = Arc::new(InMemoryWorkItemStore::with_items(project, items));
    let bus = EventBus::new();
    let recorder = Recorder::attach(&bus);
    let scheduler = Scheduler::new(
        SchedulerDeps {
            store: store.clone(),
            registry,
            bus: bus.clone(),
            snapshots: Arc::new(SnapshotStore::new(state_dir)),
        },
        config,
    );
    Harness {
        scheduler,
        store,
        recorder,
        bus,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
