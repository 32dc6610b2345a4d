use serde::Serialize;

/// Structured trace events emitted across all kernel crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    EventPushed {
        stream: String,
        scope_type: String,
        scope_id: String,
        event_id: String,
    },
    EventAcked {
        stream: String,
        event_id: String,
        reader: String,
    },
    TaskSpawned {
        task_id: String,
        task_type: String,
        parent_id: Option<String>,
    },
    TaskTransitioned {
        task_id: String,
        from: String,
        to: String,
    },
    TurnStarted {
        agent_id: String,
        llm_task_id: String,
        generation: u64,
    },
    TurnCompleted {
        agent_id: String,
        llm_task_id: String,
        output_chars: usize,
    },
    TurnCancelled {
        agent_id: String,
        llm_task_id: String,
        reason: String,
    },
    CompactionRun {
        agent_id: String,
        old_generation: u64,
        new_generation: u64,
        reason: String,
    },
    HealthSweep {
        stale_exec_tasks: usize,
        woken_agents: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "kernel_event");
    }
}
