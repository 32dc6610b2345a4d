use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use sa_domain::error::Result;
use sa_domain::model::{HistoryEntry, HistoryEntryType, NewHistoryEntry};

use crate::{map_sqlite_err, Store};

fn row_to_entry(row: &Row) -> rusqlite::Result<HistoryEntry> {
    let entry_type: String = row.get("type")?;
    let data_json: Option<String> = row.get("data")?;
    let created_at: String = row.get("created_at")?;
    Ok(HistoryEntry {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        generation: row.get::<_, i64>("generation")? as u64,
        entry_type: parse_entry_type(&entry_type),
        role: row.get("role")?,
        content: row.get("content")?,
        task_id: row.get("task_id")?,
        tool_call_id: row.get("tool_call_id")?,
        tool_name: row.get("tool_name")?,
        tool_status: row.get("tool_status")?,
        data: data_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_entry_type(s: &str) -> HistoryEntryType {
    serde_json::from_value(serde_json::Value::String(s.to_string())).unwrap_or_default()
}

fn entry_type_str(t: HistoryEntryType) -> String {
    match serde_json::to_value(t).unwrap_or(serde_json::Value::Null) {
        serde_json::Value::String(s) => s,
        _ => "system_update".to_string(),
    }
}

impl Store {
    /// Appends one history entry. The entry's `generation` is the caller's
    /// responsibility — see `sa-history::HistoryLog` for generation tracking.
    pub fn append_history_entry(&self, new_entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let entry = HistoryEntry {
            id: sa_domain::ids::new_sortable_id(),
            agent_id: new_entry.agent_id,
            generation: new_entry.generation,
            entry_type: new_entry.entry_type.unwrap_or_default(),
            role: new_entry.role,
            content: new_entry.content,
            task_id: new_entry.task_id,
            tool_call_id: new_entry.tool_call_id,
            tool_name: new_entry.tool_name,
            tool_status: new_entry.tool_status,
            data: new_entry.data,
            created_at: Utc::now(),
        };

        self.retry_busy(|conn| {
            conn.execute(
                "INSERT INTO history_entries
                 (id, agent_id, generation, type, role, content, task_id, tool_call_id, tool_name, tool_status, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.id,
                    entry.agent_id,
                    entry.generation as i64,
                    entry_type_str(entry.entry_type),
                    entry.role,
                    entry.content,
                    entry.task_id,
                    entry.tool_call_id,
                    entry.tool_name,
                    entry.tool_status,
                    entry.data.as_ref().map(|v| serde_json::to_string(v)).transpose()?,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })?;

        Ok(entry)
    }

    /// Invariant 6: only entries with `generation == g` are used to
    /// reconstruct a turn's prior messages.
    pub fn list_history_for_generation(
        &self,
        agent_id: &str,
        generation: u64,
    ) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM history_entries WHERE agent_id = ?1 AND generation = ?2 ORDER BY created_at ASC, id ASC",
            )
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map(params![agent_id, generation as i64], row_to_entry)
            .map_err(map_sqlite_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(map_sqlite_err)?);
        }
        Ok(out)
    }

    /// Highest generation recorded for this agent, or `None` if it has no
    /// history yet (caller should start at generation 1).
    pub fn latest_generation(&self, agent_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(generation) FROM history_entries WHERE agent_id = ?1",
                params![agent_id],
                |r| r.get(0),
            )
            .map_err(map_sqlite_err)?;
        Ok(max.map(|v| v as u64))
    }

    pub fn find_history_entry(
        &self,
        agent_id: &str,
        generation: u64,
        entry_type: HistoryEntryType,
    ) -> Result<Option<HistoryEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM history_entries WHERE agent_id = ?1 AND generation = ?2 AND type = ?3
             ORDER BY created_at ASC LIMIT 1",
            params![agent_id, generation as i64, entry_type_str(entry_type)],
            row_to_entry,
        )
        .optional()
        .map_err(map_sqlite_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(agent: &str, generation: u64, entry_type: HistoryEntryType, content: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            agent_id: agent.to_string(),
            generation,
            entry_type: Some(entry_type),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn append_then_list_for_generation() {
        let store = Store::open_in_memory().unwrap();
        store.append_history_entry(mk("a1", 1, HistoryEntryType::UserMessage, "hi")).unwrap();
        store.append_history_entry(mk("a1", 1, HistoryEntryType::AssistantMessage, "hello")).unwrap();
        store.append_history_entry(mk("a1", 2, HistoryEntryType::UserMessage, "after compaction")).unwrap();

        let gen1 = store.list_history_for_generation("a1", 1).unwrap();
        assert_eq!(gen1.len(), 2);
        let gen2 = store.list_history_for_generation("a1", 2).unwrap();
        assert_eq!(gen2.len(), 1);
    }

    #[test]
    fn latest_generation_tracks_max() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.latest_generation("a1").unwrap(), None);
        store.append_history_entry(mk("a1", 1, HistoryEntryType::SystemPrompt, "p")).unwrap();
        store.append_history_entry(mk("a1", 3, HistoryEntryType::ContextCompaction, "c")).unwrap();
        assert_eq!(store.latest_generation("a1").unwrap(), Some(3));
    }

    #[test]
    fn find_history_entry_returns_first_match() {
        let store = Store::open_in_memory().unwrap();
        store.append_history_entry(mk("a1", 1, HistoryEntryType::SystemPrompt, "the prompt")).unwrap();
        let found = store
            .find_history_entry("a1", 1, HistoryEntryType::SystemPrompt)
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "the prompt");
    }
}
