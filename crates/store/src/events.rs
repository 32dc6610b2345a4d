use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use sa_domain::error::{Error, Result};
use sa_domain::model::{Event, EventSummary, ScopeType};

use crate::{map_sqlite_err, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// Use the stream's default policy (`task_input` FIFO, else LIFO) — §3.
    Default,
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub reader: Option<String>,
    pub scope_type: Option<ScopeType>,
    pub scope_id: Option<String>,
    pub limit: usize,
    pub order: Option<ListOrder>,
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let metadata_json: String = row.get("metadata")?;
    let payload_json: String = row.get("payload")?;
    let read_by_json: String = row.get("read_by")?;
    let created_at: String = row.get("created_at")?;

    Ok(Event {
        id: row.get("id")?,
        stream: row.get("stream")?,
        scope_type: ScopeType::parse(&row.get::<_, String>("scope_type")?),
        scope_id: row.get("scope_id")?,
        subject: row.get("subject")?,
        body: row.get("body")?,
        metadata: serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata_json)
            .unwrap_or_default(),
        payload: serde_json::from_str::<HashMap<String, serde_json::Value>>(&payload_json)
            .unwrap_or_default(),
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        read_by: serde_json::from_str::<HashSet<String>>(&read_by_json).unwrap_or_default(),
    })
}

impl Store {
    /// §4.1 `push`. Persists atomically; fan-out to subscribers is the
    /// event bus's job, not the store's.
    pub fn push_event(&self, event: &Event) -> Result<()> {
        if event.stream.is_empty() {
            return Err(Error::InvalidArgument("event stream must not be empty".into()));
        }
        if event.body.is_empty() {
            return Err(Error::InvalidArgument("event body must not be empty".into()));
        }

        self.retry_busy(|conn| insert_event(conn, event))
    }

    /// §4.1 `list`. Returns lightweight summaries.
    pub fn list_events(&self, stream: &str, filter: &EventFilter) -> Result<Vec<EventSummary>> {
        let conn = self.conn_for_read();
        let events = query_events(&conn, stream, filter)?;
        let reader = filter.reader.as_deref();
        Ok(events
            .into_iter()
            .map(|e| {
                let read = reader.map(|r| e.is_read_by(r)).unwrap_or(false);
                EventSummary {
                    id: e.id,
                    stream: e.stream,
                    subject: e.subject,
                    created_at: e.created_at,
                    read,
                }
            })
            .collect())
    }

    /// §4.1 `read`. Full events for the given ids, filtered to `stream`.
    pub fn read_events(&self, stream: &str, ids: &[String]) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn_for_read();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT * FROM events WHERE stream = ?1 AND id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&stream];
        for id in ids {
            query_params.push(id);
        }
        let rows = stmt
            .query_map(query_params.as_slice(), row_to_event)
            .map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(map_sqlite_err)?);
        }
        Ok(out)
    }

    /// §4.1 `ack`. Idempotent: adds `reader` to each event's `read_by`.
    pub fn ack_events(&self, stream: &str, ids: &[String], reader: &str) -> Result<()> {
        if reader.is_empty() {
            return Err(Error::InvalidArgument("ack reader must not be empty".into()));
        }
        if ids.is_empty() {
            return Ok(());
        }
        self.retry_busy(|conn| {
            let tx = conn.unchecked_transaction().map_err(map_sqlite_err)?;
            for id in ids {
                let read_by_json: Option<String> = tx
                    .query_row(
                        "SELECT read_by FROM events WHERE stream = ?1 AND id = ?2",
                        params![stream, id],
                        |r| r.get(0),
                    )
                    .ok();
                let Some(read_by_json) = read_by_json else {
                    continue;
                };
                let mut read_by: HashSet<String> =
                    serde_json::from_str(&read_by_json).unwrap_or_default();
                read_by.insert(reader.to_string());
                let new_json = serde_json::to_string(&read_by)?;
                tx.execute(
                    "UPDATE events SET read_by = ?1 WHERE stream = ?2 AND id = ?3",
                    params![new_json, stream, id],
                )
                .map_err(map_sqlite_err)?;
            }
            tx.commit().map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    fn conn_for_read(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (id, stream, scope_type, scope_id, subject, body, metadata, payload, created_at, read_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id,
            event.stream,
            event.scope_type.as_str(),
            event.scope_id,
            event.subject,
            event.body,
            serde_json::to_string(&event.metadata)?,
            serde_json::to_string(&event.payload)?,
            event.created_at.to_rfc3339(),
            serde_json::to_string(&event.read_by)?,
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

fn query_events(conn: &Connection, stream: &str, filter: &EventFilter) -> Result<Vec<Event>> {
    let order = filter
        .order
        .unwrap_or(ListOrder::Default);
    let effective_order = match order {
        ListOrder::Default if stream == sa_domain::model::STREAM_TASK_INPUT => ListOrder::Fifo,
        ListOrder::Default => ListOrder::Lifo,
        other => other,
    };
    let order_sql = match effective_order {
        ListOrder::Fifo => "ASC",
        _ => "DESC",
    };

    // Scope filter: explicit scope_type/scope_id, or the §4.1 default of
    // global:* OR task:<reader>/agent:<reader>.
    let mut sql = format!("SELECT * FROM events WHERE stream = ?1");
    let mut owned: Vec<String> = vec![stream.to_string()];

    if let Some(scope_type) = filter.scope_type {
        sql.push_str(" AND scope_type = ?2");
        owned.push(scope_type.as_str().to_string());
        if let Some(scope_id) = &filter.scope_id {
            sql.push_str(" AND scope_id = ?3");
            owned.push(scope_id.clone());
        }
    } else if let Some(reader) = &filter.reader {
        sql.push_str(
            " AND ((scope_type = 'global') OR (scope_type IN ('task','agent') AND scope_id = ?2))",
        );
        owned.push(reader.clone());
    } else {
        sql.push_str(" AND scope_type = 'global'");
    }

    sql.push_str(&format!(" ORDER BY created_at {order_sql}, id {order_sql}"));

    if filter.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", filter.limit));
    }

    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> =
        owned.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), row_to_event)
        .map_err(map_sqlite_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(map_sqlite_err)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::NewEvent;

    fn mk_event(stream: &str, scope_type: ScopeType, scope_id: &str, body: &str) -> Event {
        NewEvent {
            stream: stream.to_string(),
            scope_type: Some(scope_type),
            scope_id: Some(scope_id.to_string()),
            body: body.to_string(),
            ..Default::default()
        }
        .into_event()
    }

    #[test]
    fn push_then_list_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let e = mk_event("signals", ScopeType::Global, "*", "hello");
        store.push_event(&e).unwrap();
        let listed = store.list_events("signals", &EventFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, e.id);
        assert!(!listed[0].read);
    }

    #[test]
    fn ack_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let e = mk_event("signals", ScopeType::Global, "*", "hello");
        store.push_event(&e).unwrap();
        store.ack_events("signals", &[e.id.clone()], "r1").unwrap();
        store.ack_events("signals", &[e.id.clone()], "r1").unwrap();
        let full = store.read_events("signals", &[e.id.clone()]).unwrap();
        assert_eq!(full[0].read_by.len(), 1);
    }

    #[test]
    fn self_echo_read_by_on_push() {
        let store = Store::open_in_memory().unwrap();
        let e = NewEvent {
            stream: "signals".to_string(),
            body: "hi".to_string(),
            source_id: Some("agent-1".to_string()),
            ..Default::default()
        }
        .into_event();
        store.push_event(&e).unwrap();
        let filter = EventFilter {
            reader: Some("agent-1".to_string()),
            ..Default::default()
        };
        let listed = store.list_events("signals", &filter).unwrap();
        assert!(listed[0].read);
    }

    #[test]
    fn task_input_is_fifo_others_lifo() {
        let store = Store::open_in_memory().unwrap();
        let a = mk_event("task_input", ScopeType::Global, "*", "first");
        store.push_event(&a).unwrap();
        let b = mk_event("task_input", ScopeType::Global, "*", "second");
        store.push_event(&b).unwrap();
        let listed = store.list_events("task_input", &EventFilter::default()).unwrap();
        assert_eq!(listed[0].id, a.id, "task_input must be FIFO (oldest first)");

        let c = mk_event("signals", ScopeType::Global, "*", "first");
        store.push_event(&c).unwrap();
        let d = mk_event("signals", ScopeType::Global, "*", "second");
        store.push_event(&d).unwrap();
        let listed2 = store.list_events("signals", &EventFilter::default()).unwrap();
        assert_eq!(listed2[0].id, d.id, "non-task_input streams must be LIFO (newest first)");
    }

    #[test]
    fn scoped_event_invisible_to_other_reader_by_default() {
        let store = Store::open_in_memory().unwrap();
        let e = mk_event("task_output", ScopeType::Agent, "agent-1", "scoped");
        store.push_event(&e).unwrap();
        let filter = EventFilter {
            reader: Some("agent-2".to_string()),
            ..Default::default()
        };
        let listed = store.list_events("task_output", &filter).unwrap();
        assert!(listed.is_empty());
    }
}
