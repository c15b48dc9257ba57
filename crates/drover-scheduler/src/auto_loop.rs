use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::concurrency::{ConcurrencyTracker, RunningEntry};
use crate::config::SchedulerConfig;
use crate::resolver::{dependencies_satisfied, resolve_dependencies};
use crate::snapshot::{ExecutionStateSnapshot, SnapshotStore};
use crate::store::WorkItemStore;
use drover_core::{
    ContentBlock, DroverError, DroverResult, EventBus, ExecuteOptions, ProviderMessage,
    ResultSubtype, SchedulerEvent, Scope, WorkItem, WorkItemStatus,
};
use drover_providers::ProviderRegistry;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators the scheduler is wired to.
#[derive(Clone)]
pub struct SchedulerDeps {
    /// Source of work items and sink for status changes.
    pub store: Arc<dyn WorkItemStore>,
    /// Routes models to backends.
    pub registry: Arc<ProviderRegistry>,
    /// Receives lifecycle events.
    pub bus: EventBus,
    /// Where execution state is persisted for crash recovery.
    pub snapshots: Arc<SnapshotStore>,
}

/// What a scope's loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// No loop is running for the scope.
    Stopped,
    /// Waiting for eligible work.
    IdlePolling,
    /// At least one dispatch was admitted or is in flight.
    Dispatching,
    /// The circuit breaker halted admissions.
    Paused,
}

/// Point-in-time view of one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStatus {
    /// Scope described.
    pub scope: Scope,
    /// What the loop is doing.
    pub phase: LoopPhase,
    /// Concurrency ceiling.
    pub max_concurrency: usize,
    /// Ids in flight, in admission order.
    pub running: Vec<String>,
    /// Whether the circuit breaker holds the scope.
    pub paused: bool,
    /// Failures inside the breaker window.
    pub failure_count: usize,
}

/// What [`Scheduler::recover`] did for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Scope that was recovered.
    pub scope: Scope,
    /// Every interrupted item that was moved back to pending.
    pub reset: Vec<String>,
    /// The subset of `reset` whose next dispatch resumes its old session.
    pub resumable: Vec<String>,
}

enum Outcome {
    Success {
        summary: String,
        session_id: Option<String>,
    },
    Failure { error: String },
    Cancelled,
}

/// Per-run bookkeeping; a fresh one is made on every `start`.
struct LoopRun {
    max_concurrency: usize,
    phase: Mutex<LoopPhase>,
    /// Items cancelled by an operator are not re-admitted during this run.
    cancelled: Mutex<HashSet<String>>,
    /// Blocked items already announced during this run.
    reported_blocked: Mutex<HashSet<String>>,
    dispatches: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopRun {
    fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            phase: Mutex::new(LoopPhase::IdlePolling),
            cancelled: Mutex::new(HashSet::new()),
            reported_blocked: Mutex::new(HashSet::new()),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    fn set_phase(&self, phase: LoopPhase) {
        *self.phase.lock() = phase;
    }
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    run: Arc<LoopRun>,
}

struct Inner {
    deps: SchedulerDeps,
    config: SchedulerConfig,
    tracker: ConcurrencyTracker,
    breaker: CircuitBreaker,
    loops: Mutex<HashMap<Scope, LoopHandle>>,
    /// Latest known provider session per work item.
    sessions: Mutex<HashMap<String, String>>,
    snapshot_lock: tokio::sync::Mutex<()>,
}

/// The autonomous scheduling loop, one polling task per scope.
///
/// Each poll orders the scope's items by dependency, admits the first
/// eligible one through the concurrency tracker and dispatches it to the
/// provider that owns its model. Dispatches run as their own tasks, so a
/// long agent run never holds up admission of others. Failures feed a
/// per-scope circuit breaker; state is snapshotted at every admission and
/// completion so [`Scheduler::recover`] can reconcile after a crash.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Scheduler with no loops running.
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let tracker = ConcurrencyTracker::new(config.max_concurrency);
        let breaker = CircuitBreaker::new(config.failure_threshold, config.failure_window());
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                tracker,
                breaker,
                loops: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                snapshot_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The configuration the scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the loop for a scope. `max_concurrency` overrides the configured
    /// default for this scope.
    pub async fn start(&self, scope: Scope, max_concurrency: Option<usize>) -> DroverResult<()> {
        let max = max_concurrency
            .unwrap_or(self.inner.config.max_concurrency)
            .max(1);
        {
            let mut loops = self.inner.loops.lock();
            if loops.contains_key(&scope) {
                return Err(DroverError::Scheduler(format!(
                    "loop already running for {scope}"
                )));
            }
            self.inner.tracker.set_capacity(&scope, max);
            let run = Arc::new(LoopRun::new(max));
            let token = CancellationToken::new();
            let task = tokio::spawn(run_loop(
                self.inner.clone(),
                scope.clone(),
                run.clone(),
                token.clone(),
            ));
            loops.insert(scope.clone(), LoopHandle { token, task, run });
        }

        info!(scope = %scope, max_concurrency = max, "auto loop started");
        self.inner.write_snapshot(&scope).await;
        self.inner.deps.bus.emit(SchedulerEvent::LoopStarted {
            scope,
            max_concurrency: max,
        });
        Ok(())
    }

    /// Stop a scope's loop, cancel its dispatches and wait for them to wind
    /// down. Returns false if no loop was running.
    pub async fn stop(&self, scope: &Scope) -> DroverResult<bool> {
        let Some(handle) = self.inner.loops.lock().remove(scope) else {
            return Ok(false);
        };
        handle.token.cancel();
        let signalled = self.inner.tracker.cancel_scope(scope);
        debug!(scope = %scope, signalled, "stopping auto loop");

        if let Err(e) = handle.task.await {
            error!(scope = %scope, error = %e, "loop task ended abnormally");
        }
        // Catch anything admitted by the final poll.
        self.inner.tracker.cancel_scope(scope);
        let dispatches = std::mem::take(&mut *handle.run.dispatches.lock());
        for dispatch in dispatches {
            if let Err(e) = dispatch.await {
                error!(scope = %scope, error = %e, "dispatch task ended abnormally");
            }
        }

        self.inner.write_snapshot(scope).await;
        info!(scope = %scope, "auto loop stopped");
        self.inner.deps.bus.emit(SchedulerEvent::LoopStopped {
            scope: scope.clone(),
        });
        Ok(true)
    }

    /// Lift a circuit-breaker pause. Returns whether the scope was paused.
    pub fn resume(&self, scope: &Scope) -> bool {
        if !self.inner.breaker.resume(scope) {
            return false;
        }
        info!(scope = %scope, "auto loop resumed");
        self.inner.deps.bus.emit(SchedulerEvent::LoopResumed {
            scope: scope.clone(),
        });
        true
    }

    /// Cancel one in-flight dispatch. The item returns to pending and is not
    /// picked up again until the loop is restarted.
    pub fn cancel_work_item(&self, work_item_id: &str) -> bool {
        let cancelled = self.inner.tracker.cancel(work_item_id);
        if cancelled {
            for handle in self.inner.loops.lock().values() {
                handle.run.cancelled.lock().insert(work_item_id.to_string());
            }
            info!(work_item_id = %work_item_id, "dispatch cancelled");
        }
        cancelled
    }

    /// Whether a loop is active for the scope.
    pub fn is_running(&self, scope: &Scope) -> bool {
        self.inner.loops.lock().contains_key(scope)
    }

    /// Current phase, in-flight items and breaker state of a scope.
    pub fn status(&self, scope: &Scope) -> LoopStatus {
        let (phase, max_concurrency) = match self.inner.loops.lock().get(scope) {
            Some(handle) => (*handle.run.phase.lock(), handle.run.max_concurrency),
            None => (LoopPhase::Stopped, self.inner.tracker.capacity(scope)),
        };
        LoopStatus {
            scope: scope.clone(),
            phase,
            max_concurrency,
            running: self.inner.tracker.running_ids(scope),
            paused: self.inner.breaker.is_paused(scope),
            failure_count: self.inner.breaker.failure_count(scope),
        }
    }

    /// Reconcile saved snapshots with the store after a restart.
    ///
    /// For every snapshot whose loop was running, items it recorded as in
    /// flight that the store still shows as running are reset to pending.
    /// Those with a saved session on a provider that can resume one keep it
    /// for their next dispatch. The loop is then restarted with the saved
    /// concurrency.
    pub async fn recover(&self) -> DroverResult<Vec<RecoveryReport>> {
        let mut reports = Vec::new();
        for snapshot in self.inner.deps.snapshots.load_all().await? {
            if let Some(report) = self.recover_snapshot(snapshot).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// [`Scheduler::recover`] restricted to one scope.
    pub async fn recover_scope(&self, scope: &Scope) -> DroverResult<Option<RecoveryReport>> {
        match self.inner.deps.snapshots.load(scope).await? {
            Some(snapshot) => self.recover_snapshot(snapshot).await,
            None => Ok(None),
        }
    }

    async fn recover_snapshot(
        &self,
        snapshot: ExecutionStateSnapshot,
    ) -> DroverResult<Option<RecoveryReport>> {
        let scope = snapshot.scope();
        if !snapshot.auto_loop_running || self.is_running(&scope) {
            return Ok(None);
        }

        let mut report = RecoveryReport {
            scope: scope.clone(),
            reset: Vec::new(),
            resumable: Vec::new(),
        };
        for id in &snapshot.running_work_item_ids {
            let Some(item) = self.inner.deps.store.get(id).await? else {
                warn!(scope = %scope, work_item_id = %id, "interrupted item no longer exists");
                continue;
            };
            if item.status != WorkItemStatus::Running {
                continue;
            }
            self.inner
                .deps
                .store
                .update_status(id, WorkItemStatus::Pending)
                .await?;
            report.reset.push(id.clone());

            let Some(session_id) = snapshot.session_ids.get(id) else {
                continue;
            };
            if self.inner.config.resume_interrupted && self.inner.can_resume(&item) {
                self.inner.sessions.lock().insert(id.clone(), session_id.clone());
                report.resumable.push(id.clone());
            }
        }

        info!(
            scope = %scope,
            reset = report.reset.len(),
            resumable = report.resumable.len(),
            "recovered interrupted loop"
        );
        self.start(scope, Some(snapshot.max_concurrency)).await?;
        Ok(Some(report))
    }
}

impl Inner {
    fn model_for(&self, item: &WorkItem) -> String {
        item.model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    fn can_resume(&self, item: &WorkItem) -> bool {
        self.deps
            .registry
            .provider_for_model(&self.model_for(item))
            .is_ok_and(|p| p.supports_resume())
    }

    /// Persist the scope's current state. Failures are logged, not raised.
    async fn write_snapshot(&self, scope: &Scope) {
        let _guard = self.snapshot_lock.lock().await;
        let snapshot = {
            let loops = self.loops.lock();
            let running = loops.get(scope);
            let max = running.map_or_else(|| self.tracker.capacity(scope), |h| h.run.max_concurrency);
            let mut snapshot = ExecutionStateSnapshot::new(scope, max);
            snapshot.auto_loop_running = running.is_some();
            snapshot.running_work_item_ids = self.tracker.running_ids(scope);
            let sessions = self.sessions.lock();
            snapshot.session_ids = snapshot
                .running_work_item_ids
                .iter()
                .filter_map(|id| sessions.get(id).map(|s| (id.clone(), s.clone())))
                .collect();
            snapshot
        };
        if let Err(e) = self.deps.snapshots.save(&snapshot).await {
            error!(scope = %scope, error = %e, "failed to write execution snapshot");
        }
    }

    /// One poll. Returns how long to sleep before the next.
    async fn poll_once(
        self: &Arc<Self>,
        scope: &Scope,
        run: &Arc<LoopRun>,
        idle_reported: &mut bool,
    ) -> DroverResult<Duration> {
        if self.breaker.is_paused(scope) {
            run.set_phase(LoopPhase::Paused);
            return Ok(self.config.paused_interval());
        }
        if self.tracker.running_count(scope) >= self.tracker.capacity(scope) {
            run.set_phase(LoopPhase::Dispatching);
            return Ok(self.config.capacity_interval());
        }

        // Resolve over the whole project so dependencies on other branches
        // or on finished items are not mistaken for missing ones.
        let all = self.deps.store.list(&scope.project).await?;
        let resolution = resolve_dependencies(&all);
        let branch = scope.branch.as_deref();
        self.report_blocked(scope, run, &resolution.cycles, "dependency cycle", branch);
        let missing: HashMap<&str, &str> = resolution
            .missing
            .iter()
            .map(|m| (m.work_item_id.as_str(), m.dependency_id.as_str()))
            .collect();
        for (item_id, dep) in &missing {
            if let Some(item) = all.iter().find(|w| w.id == *item_id) {
                let reason = format!("missing dependency '{dep}'");
                self.report_blocked(scope, run, std::slice::from_ref(item), &reason, branch);
            }
        }

        let candidate = {
            let cancelled = run.cancelled.lock();
            resolution
                .ordered
                .iter()
                .filter(|w| w.in_branch(branch) && w.status == WorkItemStatus::Pending)
                .filter(|w| !missing.contains_key(w.id.as_str()))
                .filter(|w| !cancelled.contains(&w.id) && !self.tracker.is_running(&w.id))
                .find(|w| dependencies_satisfied(w, &all))
                .cloned()
        };

        let Some(item) = candidate else {
            if self.tracker.running_count(scope) > 0 {
                run.set_phase(LoopPhase::Dispatching);
                return Ok(self.config.poll_interval());
            }
            run.set_phase(LoopPhase::IdlePolling);
            if !*idle_reported {
                *idle_reported = true;
                debug!(scope = %scope, "nothing eligible to run");
                self.deps.bus.emit(SchedulerEvent::LoopIdle {
                    scope: scope.clone(),
                });
            }
            return Ok(self.config.idle_interval());
        };

        let Some(entry) = self.tracker.try_admit(scope, &item.id) else {
            return Ok(self.config.poll_interval());
        };
        *idle_reported = false;
        run.set_phase(LoopPhase::Dispatching);
        debug!(scope = %scope, work_item_id = %item.id, "admitted");

        let task = tokio::spawn(dispatch(self.clone(), run.clone(), item, entry));
        let mut dispatches = run.dispatches.lock();
        dispatches.retain(|h| !h.is_finished());
        dispatches.push(task);
        Ok(self.config.poll_interval())
    }

    fn report_blocked(
        &self,
        scope: &Scope,
        run: &LoopRun,
        items: &[WorkItem],
        reason: &str,
        branch: Option<&str>,
    ) {
        for item in items {
            if !item.in_branch(branch) || item.status != WorkItemStatus::Pending {
                continue;
            }
            if !run.reported_blocked.lock().insert(item.id.clone()) {
                continue;
            }
            warn!(scope = %scope, work_item_id = %item.id, reason, "work item cannot be scheduled");
            self.deps.bus.emit(SchedulerEvent::DependencyBlocked {
                scope: scope.clone(),
                work_item_id: item.id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Run one admitted item to completion and return how it ended.
    async fn execute(&self, item: &WorkItem, entry: &RunningEntry) -> Outcome {
        let scope = &entry.scope;
        self.write_snapshot(scope).await;
        if let Err(e) = self
            .deps
            .store
            .update_status(&item.id, WorkItemStatus::Running)
            .await
        {
            return Outcome::Failure {
                error: e.to_string(),
            };
        }

        let model = self.model_for(item);
        let provider_name = self
            .deps
            .registry
            .provider_name_for_model(&model)
            .unwrap_or("unknown");
        let bare_model = self.deps.registry.strip_provider_prefix(&model);
        self.deps.bus.emit(SchedulerEvent::DispatchStarted {
            scope: scope.clone(),
            work_item_id: item.id.clone(),
            provider: provider_name.to_string(),
            model: bare_model.clone(),
        });
        info!(scope = %scope, work_item_id = %item.id, provider = provider_name, model = %bare_model, "dispatch started");

        let provider = match self.deps.registry.provider_for_model(&model) {
            Ok(p) => p,
            Err(e) => {
                return Outcome::Failure {
                    error: e.to_string(),
                }
            }
        };

        let cwd = item.workspace.clone().unwrap_or_else(|| scope.project.clone());
        let mut options = ExecuteOptions::new(build_prompt(item), bare_model, cwd)
            .with_cancel(entry.cancel.clone());
        if let Some(turns) = self.config.max_turns {
            options = options.with_max_turns(turns);
        }
        if let Some(system) = &self.config.system_prompt {
            options = options.with_system_prompt(system.clone());
        }
        if provider.supports_resume() {
            if let Some(session) = self.sessions.lock().get(&item.id).cloned() {
                debug!(work_item_id = %item.id, session_id = %session, "resuming session");
                options = options.with_resume_session(session);
            }
        }

        let mut stream = match provider.execute_query(options).await {
            Ok(stream) => stream,
            Err(e) => {
                return Outcome::Failure {
                    error: e.to_string(),
                }
            }
        };

        let mut transcript = Transcript::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => return Outcome::Cancelled,
                next = stream.next() => next,
            };
            let Some(message) = next else {
                break;
            };

            if let Some(session) = message.session_id() {
                if transcript.session_id.as_deref() != Some(session) {
                    transcript.session_id = Some(session.to_string());
                    self.sessions.lock().insert(item.id.clone(), session.to_string());
                    self.write_snapshot(scope).await;
                }
            }
            transcript.absorb(&message);
            self.deps.bus.emit(SchedulerEvent::DispatchMessage {
                scope: scope.clone(),
                work_item_id: item.id.clone(),
                message: message.clone(),
            });

            match message {
                ProviderMessage::Result {
                    subtype: ResultSubtype::Success,
                    result,
                    ..
                } => {
                    return Outcome::Success {
                        summary: result.unwrap_or_else(|| transcript.summary()),
                        session_id: transcript.session_id,
                    }
                }
                ProviderMessage::Result { subtype, result, .. } => {
                    return Outcome::Failure {
                        error: result.unwrap_or_else(|| format!("agent finished with {subtype:?}")),
                    }
                }
                ProviderMessage::Error { error, .. } => return Outcome::Failure { error },
                _ => {}
            }
        }

        if entry.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::Failure {
                error: "provider stream ended without a result".into(),
            }
        }
    }

    async fn set_status(&self, id: &str, status: WorkItemStatus) {
        if let Err(e) = self.deps.store.update_status(id, status).await {
            error!(work_item_id = %id, status = %status, error = %e, "failed to record status");
        }
    }
}

/// Text and tool activity collected from a dispatch for reporting.
#[derive(Default)]
struct Transcript {
    text: String,
    tool_calls: usize,
    session_id: Option<String>,
}

impl Transcript {
    fn absorb(&mut self, message: &ProviderMessage) {
        if !matches!(message, ProviderMessage::Assistant { .. }) {
            return;
        }
        for block in message.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    if !self.text.is_empty() {
                        self.text.push('\n');
                    }
                    self.text.push_str(text);
                }
                ContentBlock::ToolUse { .. } => self.tool_calls += 1,
                ContentBlock::ToolResult { .. } => {}
            }
        }
    }

    fn summary(&self) -> String {
        if self.text.is_empty() {
            format!("finished after {} tool calls", self.tool_calls)
        } else {
            self.text.clone()
        }
    }
}

fn build_prompt(item: &WorkItem) -> String {
    if item.description.trim().is_empty() {
        item.title.clone()
    } else {
        format!("{}\n\n{}", item.title, item.description)
    }
}

/// Releases a tracker slot when dropped, whichever way the dispatch ends.
struct SlotGuard {
    inner: Arc<Inner>,
    entry: Option<RunningEntry>,
}

impl SlotGuard {
    fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.inner.tracker.release(&entry);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// The slot is freed only once the outcome is recorded and the breaker has
/// had its say, so a tripping failure cannot let one more item in.
async fn dispatch(inner: Arc<Inner>, run: Arc<LoopRun>, item: WorkItem, entry: RunningEntry) {
    let started = Instant::now();
    let scope = entry.scope.clone();
    let mut slot = SlotGuard {
        inner: inner.clone(),
        entry: Some(entry.clone()),
    };

    let outcome = inner.execute(&item, &entry).await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let event = match outcome {
        Outcome::Success {
            summary,
            session_id,
        } => {
            inner.set_status(&item.id, WorkItemStatus::Completed).await;
            inner.sessions.lock().remove(&item.id);
            info!(scope = %scope, work_item_id = %item.id, duration_ms, "dispatch completed");
            Some(SchedulerEvent::DispatchCompleted {
                scope: scope.clone(),
                work_item_id: item.id.clone(),
                summary,
                duration_ms,
                session_id,
            })
        }
        Outcome::Failure { error } => {
            inner.set_status(&item.id, WorkItemStatus::Failed).await;
            inner.sessions.lock().remove(&item.id);
            warn!(scope = %scope, work_item_id = %item.id, duration_ms, error = %error, "dispatch failed");
            if let BreakerDecision::Tripped(count) = inner.breaker.record_failure(&scope) {
                let reason = format!(
                    "{count} failed dispatches within {}s",
                    inner.breaker.window().as_secs()
                );
                warn!(scope = %scope, failure_count = count, "circuit breaker tripped, admissions paused");
                run.set_phase(LoopPhase::Paused);
                inner.deps.bus.emit(SchedulerEvent::LoopPaused {
                    scope: scope.clone(),
                    failure_count: count,
                    reason,
                });
            }
            Some(SchedulerEvent::DispatchError {
                scope: scope.clone(),
                work_item_id: item.id.clone(),
                error,
                duration_ms,
            })
        }
        Outcome::Cancelled => {
            run.cancelled.lock().insert(item.id.clone());
            inner.set_status(&item.id, WorkItemStatus::Pending).await;
            info!(scope = %scope, work_item_id = %item.id, duration_ms, "dispatch cancelled");
            None
        }
    };

    slot.release();
    inner.write_snapshot(&scope).await;
    if let Some(event) = event {
        inner.deps.bus.emit(event);
    }
}

async fn run_loop(inner: Arc<Inner>, scope: Scope, run: Arc<LoopRun>, token: CancellationToken) {
    let mut idle_reported = false;
    loop {
        let delay = match inner.poll_once(&scope, &run, &mut idle_reported).await {
            Ok(delay) => delay,
            Err(e) => {
                warn!(scope = %scope, error = %e, "poll failed");
                inner.config.idle_interval()
            }
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(scope = %scope, "loop task exiting");
}
