//! End-to-end scenario tests (spec §8 S1, S2, S3, S5, S7) against an
//! in-memory `Store` and a scripted `StubProvider`. S4/S6 (multi-exec
//! continuation timing, external wake while waiting) exercise the same
//! `await_task`/exec machinery already covered by `sa-tools`'s inline
//! tests and are not duplicated here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sa_domain::config::Config;
use sa_domain::model::{NewEvent, Priority, ScopeType, TaskStatus, STREAM_SIGNALS, STREAM_TASK_INPUT};
use sa_providers::stub::{Script, StubProvider};
use sa_runtime::context::replay_unread_wake_events;
use sa_runtime::turn::{run_turn, TriggerMeta, TurnOutcome};
use sa_runtime::RuntimeContext;
use sa_store::Store;

fn runtime(provider: StubProvider) -> Arc<RuntimeContext> {
    let store = Arc::new(Store::open_in_memory().unwrap());
    RuntimeContext::new(store, Arc::new(provider), Config::default())
}

fn meta(event_id: &str, priority: Priority) -> TriggerMeta {
    TriggerMeta {
        event_id: event_id.to_string(),
        stream: STREAM_TASK_INPUT.to_string(),
        priority,
        request_id: sa_domain::ids::new_sortable_id(),
    }
}

#[tokio::test]
async fn s1_single_message_no_tools() {
    let provider = StubProvider::new("stub");
    provider.push(Script::text("ok"));
    let rt = runtime(provider);

    let trigger = rt
        .bus
        .push(NewEvent {
            stream: STREAM_TASK_INPUT.to_string(),
            scope_type: Some(ScopeType::Agent),
            scope_id: Some("operator".to_string()),
            body: "hello".to_string(),
            ..Default::default()
        })
        .unwrap();

    let outcome = run_turn(&rt, "operator", "operator", "hello", meta(&trigger.id, Priority::Wake))
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Completed { output } => assert_eq!(output, "ok"),
        _ => panic!("expected a completed turn"),
    }

    let llm_tasks = rt
        .tasks
        .list(&sa_store::TaskFilter { task_type: Some("llm".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(llm_tasks.len(), 1);
    assert_eq!(llm_tasks[0].status, TaskStatus::Completed);

    let listed = rt
        .bus
        .list(STREAM_TASK_INPUT, &sa_store::EventFilter { reader: Some("operator".to_string()), ..Default::default() })
        .unwrap();
    assert!(listed.iter().find(|e| e.id == trigger.id).unwrap().read, "triggering message was acked");
}

#[tokio::test]
async fn s2_interrupt_cancels_the_turn_leaves_root_task_running() {
    let provider = StubProvider::new("stub");
    provider.push(Script::Pending);
    let rt = runtime(provider);
    rt.tasks.ensure_agent_task("operator").unwrap();

    let trigger = rt
        .bus
        .push(NewEvent { stream: STREAM_TASK_INPUT.to_string(), body: "do something slow".to_string(), ..Default::default() })
        .unwrap();

    let handle = {
        let rt = rt.clone();
        let trigger_id = trigger.id.clone();
        tokio::spawn(async move {
            run_turn(&rt, "operator", "operator", "do something slow", meta(&trigger_id, Priority::Wake)).await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut metadata = HashMap::new();
    metadata.insert("priority".to_string(), serde_json::json!("interrupt"));
    rt.bus
        .push(NewEvent {
            stream: STREAM_SIGNALS.to_string(),
            scope_type: Some(ScopeType::Agent),
            scope_id: Some("operator".to_string()),
            body: "stop".to_string(),
            metadata,
            ..Default::default()
        })
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("turn should finish after interrupt")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Cancelled));

    assert_eq!(rt.tasks.get("operator").unwrap().status, TaskStatus::Running);
    let llm_tasks = rt
        .tasks
        .list(&sa_store::TaskFilter { task_type: Some("llm".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(llm_tasks[0].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn s3_wake_priority_is_selected_before_low_priority() {
    let provider = StubProvider::new("stub");
    let rt = runtime(provider);

    let mut low = HashMap::new();
    low.insert("priority".to_string(), serde_json::json!("low"));
    rt.bus
        .push(NewEvent {
            stream: STREAM_TASK_INPUT.to_string(),
            scope_type: Some(ScopeType::Agent),
            scope_id: Some("operator".to_string()),
            body: "low priority note".to_string(),
            metadata: low,
            ..Default::default()
        })
        .unwrap();

    let mut wake = HashMap::new();
    wake.insert("priority".to_string(), serde_json::json!("wake"));
    let wake_event = rt
        .bus
        .push(NewEvent {
            stream: STREAM_TASK_INPUT.to_string(),
            scope_type: Some(ScopeType::Agent),
            scope_id: Some("operator".to_string()),
            body: "urgent".to_string(),
            metadata: wake,
            ..Default::default()
        })
        .unwrap();

    let trigger = replay_unread_wake_events(&rt, "operator", 24).unwrap().expect("a wake candidate");
    assert_eq!(trigger.event.id, wake_event.id);
}

#[tokio::test]
async fn s7_provider_error_leaves_triggering_message_unacked() {
    let provider = StubProvider::new("stub");
    provider.push(Script::Events(vec![sa_domain::stream::StreamEvent::Error { message: "boom".to_string() }]));
    let rt = runtime(provider);

    let trigger = rt
        .bus
        .push(NewEvent { stream: STREAM_TASK_INPUT.to_string(), body: "hello".to_string(), ..Default::default() })
        .unwrap();

    let outcome = run_turn(&rt, "operator", "operator", "hello", meta(&trigger.id, Priority::Wake))
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Failed { .. }));

    let llm_tasks = rt
        .tasks
        .list(&sa_store::TaskFilter { task_type: Some("llm".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(llm_tasks[0].status, TaskStatus::Failed);

    let listed = rt
        .bus
        .list(STREAM_TASK_INPUT, &sa_store::EventFilter { reader: Some("operator".to_string()), ..Default::default() })
        .unwrap();
    assert!(!listed.iter().find(|e| e.id == trigger.id).unwrap().read, "triggering message stays unacked on failure");
}
