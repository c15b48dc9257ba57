//! Integration tests for execution-state snapshots and startup recovery.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{harness, registry_with, wait_for, Script, ScriptedProvider};
use drover_core::{SchedulerEvent, Scope, WorkItem, WorkItemStatus};
use drover_scheduler::{ExecutionStateSnapshot, SchedulerConfig, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn seed_snapshot(state: &std::path::Path, scope: &Scope, running: &[&str], sessions: &[(&str, &str)]) {
    let mut snapshot = ExecutionStateSnapshot::new(scope, 2);
    snapshot.running_work_item_ids = running.iter().map(|s| s.to_string()).collect();
    snapshot.session_ids = sessions
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    SnapshotStore::new(state).save(&snapshot).await.unwrap();
}

#[tokio::test]
async fn test_recover_resets_interrupted_items_and_restarts() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let scope = Scope::new(project.path());
    seed_snapshot(state.path(), &scope, &["a", "b", "c"], &[("a", "sess-a")]).await;

    let provider = Arc::new(ScriptedProvider::new(Script::success("ok")));
    let h = harness(
        project.path(),
        vec![
            WorkItem::new("a", "A").with_status(WorkItemStatus::Running),
            WorkItem::new("b", "B").with_status(WorkItemStatus::Running),
            WorkItem::new("c", "C").with_status(WorkItemStatus::Completed),
        ],
        registry_with(provider.clone()),
        state.path(),
        SchedulerConfig::fast(),
    );

    let reports = h.scheduler.recover().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].scope, scope);
    assert_eq!(reports[0].reset, vec!["a", "b"]);
    assert_eq!(reports[0].resumable, vec!["a"]);
    assert!(h.scheduler.is_running(&scope));

    let store = h.store.clone();
    assert!(
        wait_for(WAIT, || {
            store.status_of("a") == Some(WorkItemStatus::Completed)
                && store.status_of("b") == Some(WorkItemStatus::Completed)
        })
        .await
    );
    h.scheduler.stop(&scope).await.unwrap();

    let calls = provider.calls.lock();
    let resume_of = |title: &str| {
        calls
            .iter()
            .find(|o| o.prompt.as_text() == title)
            .map(|o| o.resume_session_id.clone())
            .unwrap()
    };
    assert_eq!(resume_of("A").as_deref(), Some("sess-a"));
    assert_eq!(resume_of("B"), None);
    assert_eq!(calls.len(), 2);

    assert!(h.recorder.events().contains(&SchedulerEvent::LoopStarted {
        scope: scope.clone(),
        max_concurrency: 2,
    }));
}

#[tokio::test]
async fn test_provider_without_resume_gets_fresh_session() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let scope = Scope::new(project.path());
    seed_snapshot(state.path(), &scope, &["a"], &[("a", "sess-a")]).await;

    let provider = Arc::new(ScriptedProvider::new(Script::success("ok")).without_resume());
    let h = harness(
        project.path(),
        vec![WorkItem::new("a", "A").with_status(WorkItemStatus::Running)],
        registry_with(provider.clone()),
        state.path(),
        SchedulerConfig::fast(),
    );

    let reports = h.scheduler.recover().await.unwrap();
    assert_eq!(reports[0].reset, vec!["a"]);
    assert!(reports[0].resumable.is_empty());

    let store = h.store.clone();
    assert!(wait_for(WAIT, || store.status_of("a") == Some(WorkItemStatus::Completed)).await);
    h.scheduler.stop(&scope).await.unwrap();
    assert!(provider.calls.lock()[0].resume_session_id.is_none());
}

#[tokio::test]
async fn test_stopped_loops_are_not_recovered() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let scope = Scope::new(project.path());
    let mut snapshot = ExecutionStateSnapshot::new(&scope, 1);
    snapshot.auto_loop_running = false;
    SnapshotStore::new(state.path()).save(&snapshot).await.unwrap();

    let provider = Arc::new(ScriptedProvider::new(Script::success("ok")));
    let h = harness(project.path(), vec![], registry_with(provider), state.path(), SchedulerConfig::fast());
    assert!(h.scheduler.recover().await.unwrap().is_empty());
    assert!(!h.scheduler.is_running(&scope));
}

#[tokio::test]
async fn test_snapshot_tracks_running_set() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let scope = Scope::new(project.path());
    let provider = Arc::new(ScriptedProvider::new(Script::Hang));
    let h = harness(
        project.path(),
        vec![WorkItem::new("h", "Hang")],
        registry_with(provider),
        state.path(),
        SchedulerConfig::fast(),
    );
    let snapshots = SnapshotStore::new(state.path());

    h.scheduler.start(scope.clone(), Some(3)).await.unwrap();
    let store = h.store.clone();
    assert!(wait_for(WAIT, || store.status_of("h") == Some(WorkItemStatus::Running)).await);

    let live = snapshots.load(&scope).await.unwrap().unwrap();
    assert!(live.auto_loop_running);
    assert_eq!(live.max_concurrency, 3);
    assert_eq!(live.running_work_item_ids, vec!["h"]);

    h.scheduler.stop(&scope).await.unwrap();
    let stopped = snapshots.load(&scope).await.unwrap().unwrap();
    assert!(!stopped.auto_loop_running);
    assert!(stopped.running_work_item_ids.is_empty());
    assert_eq!(h.store.status_of("h"), Some(WorkItemStatus::Pending));
}

#[tokio::test]
async fn test_recover_scope_leaves_other_scopes_alone() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let main = Scope::new(project.path());
    let feat = Scope::with_branch(project.path(), "feat");
    seed_snapshot(state.path(), &main, &[], &[]).await;
    seed_snapshot(state.path(), &feat, &[], &[]).await;

    let provider = Arc::new(ScriptedProvider::new(Script::success("ok")));
    let h = harness(project.path(), vec![], registry_with(provider), state.path(), SchedulerConfig::fast());

    let report = h.scheduler.recover_scope(&feat).await.unwrap().unwrap();
    assert_eq!(report.scope, feat);
    assert!(report.reset.is_empty());
    assert!(h.scheduler.is_running(&feat));
    assert!(!h.scheduler.is_running(&main));
    assert!(h.scheduler.recover_scope(&feat).await.unwrap().is_none());
    h.scheduler.stop(&feat).await.unwrap();
}
