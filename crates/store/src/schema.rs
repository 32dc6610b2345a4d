use rusqlite::Connection;
use sa_domain::error::Result;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            stream TEXT NOT NULL,
            scope_type TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            subject TEXT,
            body TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            read_by TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_events_listing
            ON events(stream, scope_type, scope_id, created_at);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            owner TEXT NOT NULL,
            parent_id TEXT,
            mode TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            result TEXT,
            error TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_type_status ON tasks(type, status, created_at);

        CREATE TABLE IF NOT EXISTS task_updates (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_task_updates_task ON task_updates(task_id, created_at);

        CREATE TABLE IF NOT EXISTS history_entries (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            type TEXT NOT NULL,
            role TEXT,
            content TEXT NOT NULL,
            task_id TEXT,
            tool_call_id TEXT,
            tool_name TEXT,
            tool_status TEXT,
            data TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_agent_generation
            ON history_entries(agent_id, generation, created_at);
        "#,
    )?;
    Ok(())
}
