use anyhow::Result;
use rusqlite::Connection;

pub fn create_key_value_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )?;

    Ok(())
}

pub fn create_scheduler_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            handler_name TEXT NOT NULL,
            interval_minutes INTEGER NOT NULL CHECK(interval_minutes > 0),
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cycle_leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_triggers_handler_name ON triggers(handler_name);
        "#,
    )?;

    Ok(())
}
