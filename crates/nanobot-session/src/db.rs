//! SQLite schema shared by the session store and the resource store.

use std::path::Path;

use rusqlite::{params, Connection, Result};

const SCHEMA_VERSION: i64 = 1;

/// Open (or create) the database, enable WAL and foreign keys, and run
/// pending migrations.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        params![],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            params![],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(create_tables_migration())?;
    conn.execute_batch(create_indexes_migration())?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn create_tables_migration() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        parent TEXT,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS resources (
        account_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        name TEXT NOT NULL,
        uuid TEXT NOT NULL UNIQUE,
        mime_type TEXT,
        text_content TEXT,
        blob_content BLOB,
        size INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (account_id, session_id, name)
    );
    "#
}

fn create_indexes_migration() -> &'static str {
    r#"
    CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);
    CREATE INDEX IF NOT EXISTS idx_resources_session ON resources(account_id, session_id);
    CREATE INDEX IF NOT EXISTS idx_resources_uuid ON resources(uuid);
    "#
}
