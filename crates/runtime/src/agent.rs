//! Per-agent loop (spec §4.3) and the global health monitor. Grounded on
//! `crates/gateway/src/runtime/tasks.rs`'s `TaskRunner::enqueue`
//! spawn-and-track idiom for the loop itself, and on
//! `crates/gateway/src/main.rs`'s periodic background-loop idiom for the
//! health monitor ticker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sa_domain::error::Result;
use sa_domain::model::{
    update_kind, NewEvent, ScopeType, TaskStatus, STREAM_SIGNALS,
};
use sa_domain::trace::TraceEvent;
use tokio_util::sync::CancellationToken;

use crate::context::{replay_unread_wake_events, AGENT_STREAMS};
use crate::turn::{run_turn, TriggerMeta};
use crate::RuntimeContext;

pub struct AgentLoop {
    rt: Arc<RuntimeContext>,
    agent_id: String,
}

impl AgentLoop {
    pub fn new(rt: Arc<RuntimeContext>, agent_id: impl Into<String>) -> Self {
        Self { rt, agent_id: agent_id.into() }
    }

    /// §4.3 `Run`. Loops until `shutdown` fires, processing at most one
    /// turn per wake.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.rt.tasks.ensure_agent_task(&self.agent_id)?;
        let mut sub = self
            .rt
            .bus
            .subscribe(AGENT_STREAMS.iter().map(|s| s.to_string()).collect());
        let mut tick = tokio::time::interval(Duration::from_millis(self.rt.config.runtime.loop_tick_ms));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => {}
                received = sub.receiver.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                }
            }

            let window_n = self.rt.config.runtime.context_window_n;
            match replay_unread_wake_events(&self.rt, &self.agent_id, window_n) {
                Ok(Some(trigger)) => {
                    let source = trigger
                        .event
                        .metadata
                        .get("source")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&self.agent_id)
                        .to_string();
                    let meta = TriggerMeta {
                        event_id: trigger.event.id.clone(),
                        stream: trigger.stream.clone(),
                        priority: crate::context::effective_priority(&trigger.event),
                        request_id: sa_domain::ids::new_sortable_id(),
                    };
                    if let Err(e) = run_turn(&self.rt, &self.agent_id, &source, &trigger.event.body, meta).await {
                        tracing::warn!(agent_id = %self.agent_id, error = %e, "turn failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %e, "failed to collect wake events");
                }
            }
        }
    }
}

/// §4.3 "Health monitor": a 30s ticker (global, not per-agent) that wakes
/// owners of stale `exec` tasks with a low-priority `task_input` event, and
/// emits a `task_health` snapshot onto `signals`.
pub async fn health_monitor(rt: Arc<RuntimeContext>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(rt.config.tasks.health_interval_secs));
    let mut last_wake: HashMap<String, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        let running = match rt.tasks.list(&sa_store::TaskFilter {
            task_type: Some("exec".to_string()),
            status: Some(TaskStatus::Running),
            ..Default::default()
        }) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "health monitor: failed to list running exec tasks");
                continue;
            }
        };

        let now = chrono::Utc::now();
        let staleness = chrono::Duration::seconds(rt.config.tasks.staleness_secs as i64);
        let cooldown = Duration::from_secs(rt.config.tasks.wake_cooldown_secs);
        let mut stale_exec_tasks = 0usize;
        let mut woken_agents = 0usize;

        for task in &running {
            if now - task.updated_at < staleness {
                continue;
            }
            stale_exec_tasks += 1;
            if let Some(last) = last_wake.get(&task.owner) {
                if last.elapsed() < cooldown {
                    continue;
                }
            }
            last_wake.insert(task.owner.clone(), Instant::now());
            woken_agents += 1;

            let mut metadata = HashMap::new();
            metadata.insert("priority".to_string(), serde_json::json!("low"));
            metadata.insert("task_id".to_string(), serde_json::json!(task.id));
            if let Err(e) = rt.bus.push(NewEvent {
                stream: sa_domain::model::STREAM_TASK_INPUT.to_string(),
                scope_type: Some(ScopeType::Agent),
                scope_id: Some(task.owner.clone()),
                subject: Some("task_stale".to_string()),
                body: format!("task {} has been stale since {}", task.id, task.updated_at),
                metadata,
                ..Default::default()
            }) {
                tracing::warn!(error = %e, task_id = %task.id, "health monitor: failed to push stale wake");
            }
            let _ = rt.tasks.record_update(&task.id, update_kind::PROGRESS, serde_json::json!({ "health": "stale" }));
        }

        TraceEvent::HealthSweep { stale_exec_tasks, woken_agents }.emit();

        if let Err(e) = rt.bus.push(NewEvent {
            stream: STREAM_SIGNALS.to_string(),
            body: format!("task_health: {} running exec tasks", running.len()),
            metadata: HashMap::from([("kind".to_string(), serde_json::json!("task_health"))]),
            ..Default::default()
        }) {
            tracing::warn!(error = %e, "health monitor: failed to push task_health snapshot");
        }
    }
}
