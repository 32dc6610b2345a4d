//! Interrupt and cancel/kill watchers raced against the provider stream
//! during a turn (§4.5). Two independent watchers rather than one merged
//! condition — see DESIGN.md's cross-cutting Open Question resolutions.

use std::sync::Arc;

use sa_eventbus::EventBus;
use tokio_util::sync::CancellationToken;

use crate::context::{effective_priority, AGENT_STREAMS};

/// Cancels `turn_token` the moment an interrupt-priority event targeting
/// `agent_id` arrives on any agent stream.
pub async fn interrupt_watcher(bus: Arc<EventBus>, agent_id: String, turn_token: CancellationToken) {
    let mut sub = bus.subscribe(AGENT_STREAMS.iter().map(|s| s.to_string()).collect());
    loop {
        tokio::select! {
            _ = turn_token.cancelled() => return,
            event = sub.receiver.recv() => {
                let Some(event) = event else { return };
                if event.targets(&agent_id) && effective_priority(&event) == sa_domain::model::Priority::Interrupt {
                    turn_token.cancel();
                    return;
                }
            }
        }
    }
}

/// Cancels `turn_token` when an explicit `cancel`/`kill` action naming
/// `llm_task_id` arrives on `signals`.
pub async fn command_watcher(bus: Arc<EventBus>, llm_task_id: String, turn_token: CancellationToken) {
    let mut sub = bus.subscribe(vec![sa_domain::model::STREAM_SIGNALS.to_string()]);
    loop {
        tokio::select! {
            _ = turn_token.cancelled() => return,
            event = sub.receiver.recv() => {
                let Some(event) = event else { return };
                let matches_task = event.task_id() == Some(llm_task_id.as_str());
                let is_command = matches!(event.action(), Some("cancel") | Some("kill"));
                if matches_task && is_command {
                    turn_token.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::{NewEvent, ScopeType};
    use sa_store::Store;
    use std::time::Duration;

    fn bus() -> Arc<EventBus> {
        EventBus::new(Arc::new(Store::open_in_memory().unwrap()), 64)
    }

    #[tokio::test]
    async fn interrupt_watcher_cancels_on_targeted_interrupt() {
        let bus = bus();
        let token = CancellationToken::new();
        let handle = tokio::spawn(interrupt_watcher(bus.clone(), "agent-1".to_string(), token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("priority".to_string(), serde_json::json!("interrupt"));
        bus.push(NewEvent {
            stream: "signals".to_string(),
            scope_type: Some(ScopeType::Agent),
            scope_id: Some("agent-1".to_string()),
            body: "stop".to_string(),
            metadata,
            ..Default::default()
        })
        .unwrap();

        tokio::time::timeout(Duration::from_millis(200), token.cancelled())
            .await
            .expect("token should be cancelled");
        handle.abort();
    }

    #[tokio::test]
    async fn command_watcher_ignores_other_tasks() {
        let bus = bus();
        let token = CancellationToken::new();
        let handle = tokio::spawn(command_watcher(bus.clone(), "llm-1".to_string(), token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("action".to_string(), serde_json::json!("cancel"));
        metadata.insert("task_id".to_string(), serde_json::json!("llm-2"));
        bus.push(NewEvent {
            stream: "signals".to_string(),
            body: "cancel other task".to_string(),
            metadata,
            ..Default::default()
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
        handle.abort();
    }
}
