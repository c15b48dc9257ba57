//! Integration tests for drover-core: wire formats crossing crate boundaries.

use drover_core::*;
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_dispatch_message_event_embeds_provider_message() {
    let event = SchedulerEvent::DispatchMessage {
        scope: Scope::new("/repo"),
        work_item_id: "f1".into(),
        message: ProviderMessage::assistant(vec![ContentBlock::tool_use(
            "call-1",
            "Bash",
            json!({"command": "ls"}),
        )]),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "dispatch_message");
    assert_eq!(value["message"]["type"], "assistant");
    assert_eq!(value["message"]["content"][0]["type"], "tool_use");

    let parsed: SchedulerEvent = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, event);
}

#[test]
fn test_bus_delivers_event_payload() {
    let bus = EventBus::new();
    let received = Arc::new(parking_lot::Mutex::new(None));
    let r = received.clone();
    let sub = bus.subscribe(move |e| *r.lock() = Some(e.clone()));

    bus.emit(SchedulerEvent::LoopPaused {
        scope: Scope::new("/repo"),
        failure_count: 3,
        reason: "3 failures within 60s".into(),
    });
    sub.unsubscribe();

    let got = received.lock().clone().unwrap();
    assert_eq!(got.kind(), "loop_paused");
    assert_eq!(got.scope(), &Scope::new("/repo"));
}

#[test]
fn test_work_item_roundtrip_from_store_json() {
    let raw = json!([
        {"id": "a", "title": "A", "status": "completed"},
        {"id": "b", "title": "B", "status": "pending", "dependencies": ["a"],
         "model": "cursor-gpt-5", "priority": 1, "branch": "feat/b"}
    ]);
    let items: Vec<WorkItem> = serde_json::from_value(raw).unwrap();
    assert_eq!(items[1].dependencies, vec!["a".to_string()]);
    assert!(items[1].in_branch(Some("feat/b")));
    assert!(items[0].status.satisfies_dependency());
}
