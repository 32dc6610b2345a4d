//! Task Manager (spec §4.2): durable task CRUD plus the bus side-effects
//! other components observe task progress through. Grounded on the
//! teacher's `TaskStore`/`TaskRunner` split
//! (`crates/gateway/src/runtime/tasks.rs`), but persistence is
//! `sa_store::Store`'s SQLite tables rather than an in-memory
//! `RwLock<HashMap>`.

use std::collections::HashMap;
use std::sync::Arc;

use sa_domain::error::{Error, Result};
use sa_domain::model::{
    task_type, update_kind, NewTask, ScopeType, Task, TaskMode, TaskStatus, TaskUpdate,
};
use sa_domain::trace::TraceEvent;
use sa_domain::{ids::new_sortable_id, model::NewEvent};
use sa_eventbus::EventBus;
use sa_store::{Store, TaskFilter};

pub use sa_store::TaskFilter as Filter;

pub struct TaskManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl TaskManager {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// §4.2 `spawn`. Emits a `task_input` event with `metadata.action = "spawn"`.
    pub fn spawn(&self, spec: NewTask) -> Result<Task> {
        let now = chrono::Utc::now();
        let task = Task {
            id: new_sortable_id(),
            task_type: spec.task_type,
            status: TaskStatus::Queued,
            owner: spec.owner,
            parent_id: spec.parent_id,
            mode: spec.mode,
            payload: spec.payload,
            result: None,
            error: None,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_task(&task)?;
        TraceEvent::TaskSpawned {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            parent_id: task.parent_id.clone(),
        }
        .emit();
        self.emit_transition(&task, "spawn")?;
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.store.get_task(id)
    }

    /// §4.3: "the root agent task's id is the agent id." Idempotent:
    /// returns the existing task if one is already on record; otherwise
    /// creates it fresh and `running`. The root task is never completed by
    /// a turn (only its child `llm` task is), so it never goes terminal and
    /// needs no revival here.
    pub fn ensure_agent_task(&self, agent_id: &str) -> Result<Task> {
        if let Ok(task) = self.store.get_task(agent_id) {
            return Ok(task);
        }
        let now = chrono::Utc::now();
        let task = Task {
            id: agent_id.to_string(),
            task_type: task_type::AGENT.to_string(),
            status: TaskStatus::Running,
            owner: agent_id.to_string(),
            parent_id: None,
            mode: TaskMode::Async,
            payload: HashMap::new(),
            result: None,
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_task(&task)?;
        TraceEvent::TaskSpawned {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            parent_id: task.parent_id.clone(),
        }
        .emit();
        self.emit_transition(&task, "spawn")?;
        self.emit_transition(&task, "started")?;
        Ok(task)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter)
    }

    /// §4.2 `claimQueued`. Idempotent: does not change status.
    pub fn claim_queued(&self, task_type: &str, limit: usize) -> Result<Vec<Task>> {
        self.store.claim_queued(task_type, limit)
    }

    pub fn mark_running(&self, id: &str) -> Result<Task> {
        let task = self.store.transition_task(id, TaskStatus::Running, None, None)?;
        self.emit_transition(&task, "started")?;
        Ok(task)
    }

    /// §4.2 `send`. Appends an `input` task update and emits a `task_input`
    /// event; does not itself transition status.
    pub fn send(&self, id: &str, input: serde_json::Value) -> Result<TaskUpdate> {
        let task = self.store.get_task(id)?;
        let update = self.record_update(id, update_kind::INPUT, input)?;
        self.emit_transition(&task, "send")?;
        Ok(update)
    }

    pub fn record_update(
        &self,
        task_id: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<TaskUpdate> {
        let mut map = HashMap::new();
        if let serde_json::Value::Object(obj) = payload {
            map.extend(obj);
        } else if !payload.is_null() {
            map.insert("value".to_string(), payload);
        }
        let update = TaskUpdate {
            id: new_sortable_id(),
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            payload: map,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_task_update(&update)?;
        Ok(update)
    }

    pub fn complete(&self, id: &str, result: serde_json::Value) -> Result<Task> {
        let task = self.store.transition_task(id, TaskStatus::Completed, Some(result), None)?;
        self.emit_transition(&task, "completed")?;
        Ok(task)
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<Task> {
        let task = self.store.transition_task(id, TaskStatus::Failed, None, Some(error.into()))?;
        self.emit_transition(&task, "failed")?;
        Ok(task)
    }

    /// §4.2 `cancel`. Non-recursive unless `caller` is the task's own owner.
    pub fn cancel(&self, id: &str, reason: impl Into<String>, caller: &str) -> Result<Task> {
        let reason = reason.into();
        let current = self.store.get_task(id)?;
        if caller == current.owner {
            let ids = self.store.cancel_recursive(id, &reason)?;
            if ids.is_empty() {
                return Err(Error::Conflict(format!("task {id} is already terminal")));
            }
            return self.finish_cascade(&ids, "cancelled");
        }
        let task = self.store.transition_task(id, TaskStatus::Cancelled, None, Some(reason))?;
        self.emit_transition(&task, "cancelled")?;
        Ok(task)
    }

    /// §4.2 `kill`. Always recursive.
    pub fn kill(&self, id: &str, reason: impl Into<String>) -> Result<Task> {
        let reason = reason.into();
        let ids = self.store.kill_recursive(id, &reason)?;
        if ids.is_empty() {
            return Err(Error::Conflict(format!("task {id} is already terminal")));
        }
        self.finish_cascade(&ids, "killed")
    }

    fn finish_cascade(&self, ids: &[String], action: &str) -> Result<Task> {
        for id in ids {
            if let Ok(task) = self.store.get_task(id) {
                self.emit_transition(&task, action)?;
            }
        }
        self.store.get_task(ids.first().ok_or_else(|| Error::Other("empty cascade".into()))?)
    }

    pub fn list_updates(&self, id: &str, limit: usize) -> Result<Vec<TaskUpdate>> {
        self.store.list_task_updates(id, limit)
    }

    pub fn list_updates_since(
        &self,
        id: &str,
        after_id: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskUpdate>> {
        self.store.list_task_updates_since(id, after_id, kind, limit)
    }

    fn emit_transition(&self, task: &Task, action: &str) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("action".to_string(), serde_json::Value::String(action.to_string()));
        metadata.insert("task_id".to_string(), serde_json::Value::String(task.id.clone()));
        metadata.insert(
            "task_kind".to_string(),
            serde_json::Value::String(task.task_type.clone()),
        );
        // `task_input` wakes the owning agent's loop (§4.3: scope_id=agentId);
        // `task_output` is scoped by the task itself so `await_task` can
        // subscribe to exactly the task it spawned (§10).
        let (stream, scope_id) = if action == "spawn" || action == "send" {
            (sa_domain::model::STREAM_TASK_INPUT, task.owner.clone())
        } else {
            (sa_domain::model::STREAM_TASK_OUTPUT, task.id.clone())
        };
        self.bus.push(NewEvent {
            stream: stream.to_string(),
            scope_type: Some(ScopeType::Task),
            scope_id: Some(scope_id),
            subject: Some(action.to_string()),
            body: format!("task {} {action}", task.id),
            metadata,
            ..Default::default()
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TaskManager {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone(), 64);
        TaskManager::new(store, bus)
    }

    fn new_task(task_type: &str, owner: &str) -> NewTask {
        NewTask {
            task_type: task_type.to_string(),
            owner: owner.to_string(),
            mode: TaskMode::Async,
            ..Default::default()
        }
    }

    #[test]
    fn spawn_then_get() {
        let mgr = manager();
        let t = mgr.spawn(new_task("exec", "agent-1")).unwrap();
        assert_eq!(mgr.get(&t.id).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn claim_queued_is_idempotent() {
        let mgr = manager();
        mgr.spawn(new_task("exec", "agent-1")).unwrap();
        let first = mgr.claim_queued("exec", 10).unwrap();
        let second = mgr.claim_queued("exec", 10).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn complete_emits_task_output_event() {
        let mgr = manager();
        let t = mgr.spawn(new_task("llm", "agent-1")).unwrap();
        mgr.mark_running(&t.id).unwrap();
        mgr.complete(&t.id, serde_json::json!({"ok": true})).unwrap();

        let listed = mgr
            .bus
            .list(sa_domain::model::STREAM_TASK_OUTPUT, &sa_store::EventFilter::default())
            .unwrap();
        assert!(listed.iter().any(|e| e.subject.as_deref() == Some("completed")));
    }

    #[test]
    fn cancel_by_non_owner_is_not_recursive() {
        let mgr = manager();
        let root = mgr.spawn(new_task("agent", "agent-1")).unwrap();
        let child = mgr
            .spawn(NewTask {
                parent_id: Some(root.id.clone()),
                ..new_task("llm", "agent-1")
            })
            .unwrap();

        mgr.cancel(&root.id, "user request", "someone-else").unwrap();
        assert_eq!(mgr.get(&child.id).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn cancel_by_owner_cascades() {
        let mgr = manager();
        let root = mgr.spawn(new_task("agent", "agent-1")).unwrap();
        let child = mgr
            .spawn(NewTask {
                parent_id: Some(root.id.clone()),
                ..new_task("llm", "agent-1")
            })
            .unwrap();

        mgr.cancel(&root.id, "shutdown", "agent-1").unwrap();
        assert_eq!(mgr.get(&child.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn kill_is_always_recursive() {
        let mgr = manager();
        let root = mgr.spawn(new_task("agent", "agent-1")).unwrap();
        let child = mgr
            .spawn(NewTask {
                parent_id: Some(root.id.clone()),
                ..new_task("llm", "agent-1")
            })
            .unwrap();

        mgr.kill(&root.id, "fatal").unwrap();
        assert_eq!(mgr.get(&child.id).unwrap().status, TaskStatus::Killed);
    }

    #[test]
    fn ensure_agent_task_uses_the_agent_id_as_the_task_id() {
        let mgr = manager();
        let task = mgr.ensure_agent_task("agent-1").unwrap();
        assert_eq!(task.id, "agent-1");
        assert_eq!(task.status, TaskStatus::Running);

        let again = mgr.ensure_agent_task("agent-1").unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.created_at, task.created_at, "idempotent, not re-created");
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.get("nope").unwrap_err(), Error::NotFound(_)));
    }

    #[test]
    fn complete_twice_is_conflict() {
        let mgr = manager();
        let t = mgr.spawn(new_task("exec", "agent-1")).unwrap();
        mgr.mark_running(&t.id).unwrap();
        mgr.complete(&t.id, serde_json::Value::Null).unwrap();
        let err = mgr.complete(&t.id, serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
