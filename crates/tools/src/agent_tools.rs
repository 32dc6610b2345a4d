//! Agent Tools core subset (spec §10): `noop`, `send_message`, `send_task`,
//! `await_task`, `cancel`/`kill`, and the `exec` dispatcher. Grounded on
//! `crates/gateway/src/runtime/tools.rs`'s `build_tool_definitions`/
//! `dispatch_tool` match-by-name idiom — these tools are themselves thin
//! orchestration over `sa-tasks`/`sa-eventbus` rather than local work.

use std::collections::HashSet;
use std::time::Duration;

use sa_domain::error::Result;
use sa_domain::model::{
    task_type, update_kind, NewTask, ScopeType, Task, TaskMode, TaskUpdate, STREAM_EXTERNAL,
    STREAM_TASK_OUTPUT,
};
use sa_domain::model::NewEvent;
use sa_domain::tool::ToolDefinition;
use sa_eventbus::EventBus;
use sa_tasks::TaskManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identity of the calling agent, threaded through every dispatch so tools
/// know whose turn they're acting on behalf of.
pub struct ToolContext {
    pub agent_id: String,
}

pub struct AgentTools {
    tasks: Arc<TaskManager>,
    bus: Arc<EventBus>,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    target: String,
    body: String,
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendTaskArgs {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AwaitTaskArgs {
    task_id: String,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct CancelArgs {
    task_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ExecArgs {
    code: String,
    #[serde(default)]
    wait_seconds: u64,
}

/// §4.6: tools that wait for wakes must ignore ids already folded into the
/// current turn's frame, so they don't return on an event the model has
/// already seen.
pub type IgnoredWakeIds = HashSet<String>;

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AwaitTaskResult {
    Task(Task),
    TimedOut(TaskUpdate),
}

impl AgentTools {
    pub fn new(tasks: Arc<TaskManager>, bus: Arc<EventBus>) -> Self {
        Self { tasks, bus }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "noop".into(),
                description: "Does nothing. Returns an empty result.".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            ToolDefinition {
                name: "send_message".into(),
                description: "Send a message to another agent.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "target": { "type": "string", "description": "Recipient agent id" },
                        "body": { "type": "string", "description": "Message body" },
                        "priority": { "type": "string", "enum": ["interrupt", "wake", "normal", "low"] }
                    },
                    "required": ["target", "body"]
                }),
            },
            ToolDefinition {
                name: "send_task".into(),
                description: "Spawn a child task owned by this agent.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "description": "Task type" },
                        "payload": { "type": "object" },
                        "mode": { "type": "string", "enum": ["sync", "async"] }
                    },
                    "required": ["type"]
                }),
            },
            ToolDefinition {
                name: "await_task".into(),
                description: "Wait for a task to reach a terminal status, up to a timeout.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "timeout_ms": { "type": "integer" }
                    },
                    "required": ["task_id", "timeout_ms"]
                }),
            },
            ToolDefinition {
                name: "cancel".into(),
                description: "Cancel a task (recursive only when called by its owning agent).".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "task_id": { "type": "string" }, "reason": { "type": "string" } },
                    "required": ["task_id", "reason"]
                }),
            },
            ToolDefinition {
                name: "kill".into(),
                description: "Kill a task and all of its descendants.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "task_id": { "type": "string" }, "reason": { "type": "string" } },
                    "required": ["task_id", "reason"]
                }),
            },
            ToolDefinition {
                name: "exec".into(),
                description: "Run code in the external sandbox worker. Does not execute locally.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "code": { "type": "string" },
                        "wait_seconds": { "type": "integer", "description": "0 = return immediately with the queued task id" }
                    },
                    "required": ["code"]
                }),
            },
        ]
    }

    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        arguments: &serde_json::Value,
        ignored_wake_ids: &IgnoredWakeIds,
    ) -> (String, bool) {
        match tool_name {
            "noop" => (serde_json::json!({}).to_string(), false),
            "send_message" => to_tuple(self.send_message(ctx, arguments)),
            "send_task" => to_tuple(self.send_task(ctx, arguments)),
            "await_task" => to_tuple(self.await_task(arguments, ignored_wake_ids).await),
            "cancel" => to_tuple(self.cancel(ctx, arguments)),
            "kill" => to_tuple(self.kill(arguments)),
            "exec" => to_tuple(self.exec(ctx, arguments, ignored_wake_ids).await),
            _ => (format!("unknown tool: {tool_name}"), true),
        }
    }

    fn send_message(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> Result<serde_json::Value> {
        let args: SendMessageArgs = serde_json::from_value(arguments.clone())?;
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("kind".to_string(), serde_json::Value::String("message".to_string()));
        if let Some(priority) = args.priority {
            metadata.insert("priority".to_string(), serde_json::Value::String(priority));
        }
        let event = self.bus.push(NewEvent {
            stream: STREAM_EXTERNAL.to_string(),
            scope_type: Some(ScopeType::Task),
            scope_id: Some(args.target),
            body: args.body,
            metadata,
            source_id: Some(ctx.agent_id.clone()),
            ..Default::default()
        })?;
        Ok(serde_json::json!({ "event_id": event.id }))
    }

    fn send_task(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> Result<Task> {
        let args: SendTaskArgs = serde_json::from_value(arguments.clone())?;
        let mode = match args.mode.as_deref() {
            Some("sync") => TaskMode::Sync,
            _ => TaskMode::Async,
        };
        let mut payload = std::collections::HashMap::new();
        if let serde_json::Value::Object(obj) = args.payload {
            payload.extend(obj);
        }
        self.tasks.spawn(NewTask {
            task_type: args.task_type,
            owner: ctx.agent_id.clone(),
            parent_id: Some(ctx.agent_id.clone()),
            mode,
            payload,
            metadata: std::collections::HashMap::new(),
        })
    }

    /// §10 `await_task`: subscribes to `task_output` scoped to `task_id`,
    /// ignoring ids already folded into the turn's frame (§4.6). Returns
    /// the terminal task, or an `await_timeout` update if the deadline
    /// elapses first — the task itself is left non-terminal (per S5).
    async fn await_task(
        &self,
        arguments: &serde_json::Value,
        ignored_wake_ids: &IgnoredWakeIds,
    ) -> Result<AwaitTaskResult> {
        let args: AwaitTaskArgs = serde_json::from_value(arguments.clone())?;

        let current = self.tasks.get(&args.task_id)?;
        if current.status.is_terminal() {
            return Ok(AwaitTaskResult::Task(current));
        }

        let mut sub = self.bus.subscribe(vec![STREAM_TASK_OUTPUT.to_string()]);
        let deadline = tokio::time::sleep(Duration::from_millis(args.timeout_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                received = sub.receiver.recv() => {
                    let Some(event) = received else { break };
                    if ignored_wake_ids.contains(&event.id) {
                        continue;
                    }
                    if event.scope_id != args.task_id {
                        continue;
                    }
                    let task = self.tasks.get(&args.task_id)?;
                    if task.status.is_terminal() {
                        return Ok(AwaitTaskResult::Task(task));
                    }
                }
                _ = &mut deadline => {
                    let update = self.tasks.record_update(&args.task_id, update_kind::AWAIT_TIMEOUT, serde_json::json!({}))?;
                    return Ok(AwaitTaskResult::TimedOut(update));
                }
            }
        }

        // Subscription closed without a terminal status; one last check
        // before surfacing whatever the task's current status is.
        Ok(AwaitTaskResult::Task(self.tasks.get(&args.task_id)?))
    }

    fn cancel(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> Result<Task> {
        let args: CancelArgs = serde_json::from_value(arguments.clone())?;
        self.tasks.cancel(&args.task_id, args.reason, &ctx.agent_id)
    }

    fn kill(&self, arguments: &serde_json::Value) -> Result<Task> {
        let args: CancelArgs = serde_json::from_value(arguments.clone())?;
        self.tasks.kill(&args.task_id, args.reason)
    }

    /// §10 `exec`: spawns a queued `exec` task and never runs anything
    /// locally (§6.5 — the external worker owns execution). `wait_seconds >
    /// 0` bounds an internal `await_task`.
    async fn exec(
        &self,
        ctx: &ToolContext,
        arguments: &serde_json::Value,
        ignored_wake_ids: &IgnoredWakeIds,
    ) -> Result<AwaitTaskResult> {
        let args: ExecArgs = serde_json::from_value(arguments.clone())?;
        let mut payload = std::collections::HashMap::new();
        payload.insert("code".to_string(), serde_json::Value::String(args.code));

        let task = self.tasks.spawn(NewTask {
            task_type: task_type::EXEC.to_string(),
            owner: ctx.agent_id.clone(),
            parent_id: Some(ctx.agent_id.clone()),
            mode: TaskMode::Async,
            payload,
            metadata: std::collections::HashMap::new(),
        })?;

        if args.wait_seconds == 0 {
            return Ok(AwaitTaskResult::Task(task));
        }

        self.await_task(
            &serde_json::json!({ "task_id": task.id, "timeout_ms": args.wait_seconds * 1000 }),
            ignored_wake_ids,
        )
        .await
    }
}

fn to_tuple<T: Serialize>(result: Result<T>) -> (String, bool) {
    match result {
        Ok(value) => (serde_json::to_string_pretty(&value).unwrap_or_default(), false),
        Err(e) => (e.to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::TaskStatus;
    use sa_store::Store;

    fn tools() -> (AgentTools, Arc<TaskManager>, Arc<EventBus>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone(), 64);
        let tasks = Arc::new(TaskManager::new(store, bus.clone()));
        (AgentTools::new(tasks.clone(), bus.clone()), tasks, bus)
    }

    fn ctx() -> ToolContext {
        ToolContext { agent_id: "agent-1".to_string() }
    }

    #[tokio::test]
    async fn send_task_sets_parent_and_owner_to_calling_agent() {
        let (tools, tasks, _bus) = tools();
        let (out, is_error) = tools
            .dispatch(&ctx(), "send_task", &serde_json::json!({ "type": "exec" }), &IgnoredWakeIds::new())
            .await;
        assert!(!is_error, "{out}");
        let task: Task = serde_json::from_str(&out).unwrap();
        assert_eq!(task.owner, "agent-1");
        assert_eq!(task.parent_id.as_deref(), Some("agent-1"));
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn await_task_returns_immediately_for_already_terminal_task() {
        let (tools, tasks, _bus) = tools();
        let task = tasks
            .spawn(NewTask { task_type: "exec".to_string(), owner: "agent-1".to_string(), ..Default::default() })
            .unwrap();
        tasks.mark_running(&task.id).unwrap();
        tasks.complete(&task.id, serde_json::json!({"ok": true})).unwrap();

        let (out, is_error) = tools
            .dispatch(
                &ctx(),
                "await_task",
                &serde_json::json!({ "task_id": task.id, "timeout_ms": 1000 }),
                &IgnoredWakeIds::new(),
            )
            .await;
        assert!(!is_error, "{out}");
        let result: Task = serde_json::from_str(&out).unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn await_task_times_out_and_leaves_task_non_terminal() {
        let (tools, tasks, _bus) = tools();
        let task = tasks
            .spawn(NewTask { task_type: "exec".to_string(), owner: "agent-1".to_string(), ..Default::default() })
            .unwrap();

        let handle = tokio::spawn({
            let tools = Arc::new(tools);
            let task_id = task.id.clone();
            async move {
                tools
                    .dispatch(
                        &ctx(),
                        "await_task",
                        &serde_json::json!({ "task_id": task_id, "timeout_ms": 50 }),
                        &IgnoredWakeIds::new(),
                    )
                    .await
            }
        });
        tokio::time::advance(Duration::from_millis(100)).await;
        let (out, is_error) = handle.await.unwrap();
        assert!(!is_error, "{out}");
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn kill_wraps_task_manager_kill() {
        let (tools, tasks, _bus) = tools();
        let task = tasks
            .spawn(NewTask { task_type: "exec".to_string(), owner: "agent-1".to_string(), ..Default::default() })
            .unwrap();
        let (out, is_error) = tools
            .dispatch(&ctx(), "kill", &serde_json::json!({ "task_id": task.id, "reason": "stop" }), &IgnoredWakeIds::new())
            .await;
        assert!(!is_error, "{out}");
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Killed);
    }

    #[tokio::test]
    async fn send_message_pushes_scoped_event_with_self_echo_prevention() {
        let (tools, _tasks, bus) = tools();
        let (out, is_error) = tools
            .dispatch(
                &ctx(),
                "send_message",
                &serde_json::json!({ "target": "agent-2", "body": "hi" }),
                &IgnoredWakeIds::new(),
            )
            .await;
        assert!(!is_error, "{out}");
        let listed = bus.list(STREAM_EXTERNAL, &sa_store::EventFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].read, "reader 'agent-2' did not send it, so it's unread for them");
    }
}
