use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sa_domain::error::{Error, Result};
use sa_domain::model::{Task, TaskMode, TaskStatus, TaskUpdate};
use sa_domain::trace::TraceEvent;

use crate::{map_sqlite_err, Store};

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub owner: Option<String>,
    pub parent_id: Option<String>,
    pub limit: usize,
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let payload_json: String = row.get("payload")?;
    let metadata_json: String = row.get("metadata")?;
    let result_json: Option<String> = row.get("result")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: row.get("id")?,
        task_type: row.get("type")?,
        status: TaskStatus::parse(&row.get::<_, String>("status")?).unwrap_or(TaskStatus::Queued),
        owner: row.get("owner")?,
        parent_id: row.get("parent_id")?,
        mode: if row.get::<_, String>("mode")? == "sync" {
            TaskMode::Sync
        } else {
            TaskMode::Async
        },
        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_task_update(row: &Row) -> rusqlite::Result<TaskUpdate> {
    let payload_json: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    Ok(TaskUpdate {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        kind: row.get("kind")?,
        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
        created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.retry_busy(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, type, status, owner, parent_id, mode, payload, result, error, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id,
                    task.task_type,
                    task.status.as_str(),
                    task.owner,
                    task.parent_id,
                    if task.mode == TaskMode::Sync { "sync" } else { "async" },
                    serde_json::to_string(&task.payload)?,
                    task.result.as_ref().map(|v| serde_json::to_string(v)).transpose()?,
                    task.error,
                    serde_json::to_string(&task.metadata)?,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()
            .map_err(map_sqlite_err)?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT * FROM tasks WHERE 1=1".to_string();
        let mut owned: Vec<String> = Vec::new();

        if let Some(t) = &filter.task_type {
            owned.push(t.clone());
            sql.push_str(&format!(" AND type = ?{}", owned.len()));
        }
        if let Some(s) = filter.status {
            owned.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", owned.len()));
        }
        if let Some(o) = &filter.owner {
            owned.push(o.clone());
            sql.push_str(&format!(" AND owner = ?{}", owned.len()));
        }
        if let Some(p) = &filter.parent_id {
            owned.push(p.clone());
            sql.push_str(&format!(" AND parent_id = ?{}", owned.len()));
        }
        sql.push_str(" ORDER BY created_at ASC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }

        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            owned.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_task).map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(map_sqlite_err)?);
        }
        Ok(out)
    }

    /// §4.2 `claimQueued`: idempotent read, does not transition status.
    pub fn claim_queued(&self, task_type: &str, limit: usize) -> Result<Vec<Task>> {
        self.list_tasks(&TaskFilter {
            task_type: Some(task_type.to_string()),
            status: Some(TaskStatus::Queued),
            limit,
            ..Default::default()
        })
    }

    /// Applies a validated status transition plus optional result/error.
    /// Rejects transitions out of a terminal state with `Conflict`.
    pub fn transition_task(
        &self,
        id: &str,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Task> {
        let mut from = None;
        let task = self.retry_busy(|conn| {
            let task = conn
                .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
                .optional()
                .map_err(map_sqlite_err)?
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

            if task.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "task {id} is already terminal ({})",
                    task.status.as_str()
                )));
            }
            from = Some(task.status);

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    to.as_str(),
                    result.as_ref().map(|v| serde_json::to_string(v)).transpose()?,
                    error,
                    now,
                    id,
                ],
            )
            .map_err(map_sqlite_err)?;

            // Built from the row already in hand rather than re-querying
            // through `get_task` — that would re-lock `self.conn`, which
            // `retry_busy` is already holding for this closure.
            Ok(Task {
                status: to,
                updated_at: now.parse().unwrap_or_else(|_| Utc::now()),
                result: result.clone(),
                error: error.clone(),
                ..task
            })
        })?;

        if let Some(from) = from {
            TraceEvent::TaskTransitioned {
                task_id: task.id.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .emit();
        }
        Ok(task)
    }

    /// §4.2 `kill` recursion: all descendants transition to `killed` in
    /// one transaction. Returns the ids actually transitioned.
    pub fn kill_recursive(&self, id: &str, reason: &str) -> Result<Vec<String>> {
        self.retry_busy(|conn| cascade_recursive_tx(conn, id, TaskStatus::Killed, Some(reason)))
    }

    /// Recursive `cancel`, used only when the caller is the task's own
    /// owner (§4.2: "`cancel` is non-recursive unless the caller is the
    /// owning agent").
    pub fn cancel_recursive(&self, id: &str, reason: &str) -> Result<Vec<String>> {
        self.retry_busy(|conn| cascade_recursive_tx(conn, id, TaskStatus::Cancelled, Some(reason)))
    }

    pub fn insert_task_update(&self, update: &TaskUpdate) -> Result<()> {
        self.retry_busy(|conn| {
            conn.execute(
                "INSERT INTO task_updates (id, task_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    update.id,
                    update.task_id,
                    update.kind,
                    serde_json::to_string(&update.payload)?,
                    update.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    pub fn list_task_updates(&self, task_id: &str, limit: usize) -> Result<Vec<TaskUpdate>> {
        let conn = self.conn.lock();
        let sql = if limit > 0 {
            format!(
                "SELECT * FROM task_updates WHERE task_id = ?1 ORDER BY created_at ASC LIMIT {limit}"
            )
        } else {
            "SELECT * FROM task_updates WHERE task_id = ?1 ORDER BY created_at ASC".to_string()
        };
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map(params![task_id], row_to_task_update)
            .map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(map_sqlite_err)?);
        }
        Ok(out)
    }

    pub fn list_task_updates_since(
        &self,
        task_id: &str,
        after_id: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskUpdate>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT * FROM task_updates WHERE task_id = ?1".to_string();
        let mut owned: Vec<String> = vec![task_id.to_string()];
        if let Some(after) = after_id {
            owned.push(after.to_string());
            sql.push_str(&format!(" AND id > ?{}", owned.len()));
        }
        if let Some(k) = kind {
            owned.push(k.to_string());
            sql.push_str(&format!(" AND kind = ?{}", owned.len()));
        }
        sql.push_str(" ORDER BY id ASC");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            owned.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_refs.as_slice(), row_to_task_update)
            .map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(map_sqlite_err)?);
        }
        Ok(out)
    }
}

fn cascade_recursive_tx(
    conn: &Connection,
    root_id: &str,
    to: TaskStatus,
    reason: Option<&str>,
) -> Result<Vec<String>> {
    let tx = conn.unchecked_transaction().map_err(map_sqlite_err)?;
    let mut transitioned = Vec::new();
    let mut frontier = vec![root_id.to_string()];

    while let Some(id) = frontier.pop() {
        let status: Option<String> = tx
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(map_sqlite_err)?;
        let Some(status) = status else { continue };
        let is_terminal = TaskStatus::parse(&status).map(|s| s.is_terminal()).unwrap_or(true);
        if !is_terminal {
            tx.execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![to.as_str(), reason, Utc::now().to_rfc3339(), id],
            )
            .map_err(map_sqlite_err)?;
            transitioned.push(id.clone());
        }

        let mut stmt = tx
            .prepare("SELECT id FROM tasks WHERE parent_id = ?1")
            .map_err(map_sqlite_err)?;
        let children = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))
            .map_err(map_sqlite_err)?;
        for child in children {
            frontier.push(child.map_err(map_sqlite_err)?);
        }
    }

    tx.commit().map_err(map_sqlite_err)?;
    Ok(transitioned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_task(store: &Store, task_type: &str, owner: &str, parent_id: Option<&str>) -> Task {
        let now = Utc::now();
        let task = Task {
            id: sa_domain::ids::new_sortable_id(),
            task_type: task_type.to_string(),
            status: TaskStatus::Queued,
            owner: owner.to_string(),
            parent_id: parent_id.map(|s| s.to_string()),
            mode: TaskMode::Async,
            payload: HashMap::new(),
            result: None,
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        store.insert_task(&task).unwrap();
        task
    }

    #[test]
    fn claim_queued_does_not_transition() {
        let store = Store::open_in_memory().unwrap();
        let t = mk_task(&store, "exec", "agent-1", None);
        let claimed = store.claim_queued("exec", 10).unwrap();
        assert_eq!(claimed.len(), 1);
        let reloaded = store.get_task(&t.id).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queued);
    }

    #[test]
    fn transition_out_of_terminal_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        let t = mk_task(&store, "llm", "agent-1", None);
        store.transition_task(&t.id, TaskStatus::Running, None, None).unwrap();
        store.transition_task(&t.id, TaskStatus::Completed, None, None).unwrap();
        let err = store.transition_task(&t.id, TaskStatus::Failed, None, None).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_task("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn kill_recursive_transitions_all_descendants() {
        let store = Store::open_in_memory().unwrap();
        let root = mk_task(&store, "agent", "agent-1", None);
        let child = mk_task(&store, "llm", "agent-1", Some(&root.id));
        let grandchild = mk_task(&store, "exec", "agent-1", Some(&child.id));
        store.transition_task(&root.id, TaskStatus::Running, None, None).unwrap();
        store.transition_task(&child.id, TaskStatus::Running, None, None).unwrap();

        let killed = store.kill_recursive(&root.id, "fatal").unwrap();
        assert_eq!(killed.len(), 3);
        assert_eq!(store.get_task(&child.id).unwrap().status, TaskStatus::Killed);
        assert_eq!(store.get_task(&grandchild.id).unwrap().status, TaskStatus::Killed);
    }

    #[test]
    fn kill_twice_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let t = mk_task(&store, "exec", "agent-1", None);
        store.kill_recursive(&t.id, "fatal").unwrap();
        store.kill_recursive(&t.id, "fatal").unwrap();
        assert_eq!(store.get_task(&t.id).unwrap().status, TaskStatus::Killed);
    }

    #[test]
    fn task_update_since_filters_by_id() {
        let store = Store::open_in_memory().unwrap();
        let t = mk_task(&store, "llm", "agent-1", None);
        let u1 = TaskUpdate {
            id: sa_domain::ids::new_sortable_id(),
            task_id: t.id.clone(),
            kind: "llm_text".to_string(),
            payload: HashMap::new(),
            created_at: Utc::now(),
        };
        store.insert_task_update(&u1).unwrap();
        let u2 = TaskUpdate {
            id: sa_domain::ids::new_sortable_id(),
            task_id: t.id.clone(),
            kind: "llm_text".to_string(),
            payload: HashMap::new(),
            created_at: Utc::now(),
        };
        store.insert_task_update(&u2).unwrap();

        let since = store.list_task_updates_since(&t.id, Some(&u1.id), None, 0).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, u2.id);
    }
}
