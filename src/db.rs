use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::rc::Rc;

/// Shared handle to the single database connection. The whole job is
/// single-threaded, so plain reference counting is enough.
pub type Db = Rc<Connection>;

/// Open (or create) the bounce database and make sure the schema exists.
pub fn open(db_path: &str) -> Result<Db> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open bounce database: {db_path}"))?;
    init_schema(&conn)?;
    Ok(Rc::new(conn))
}

/// In-memory database with the full schema, for tests.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
    init_schema(&conn)?;
    Ok(Rc::new(conn))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bounce (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            header TEXT NOT NULL,
            data TEXT NOT NULL,
            created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bounce_link (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bounce_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            message_id INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS bounce_rule (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            priority INTEGER NOT NULL DEFAULT 0,
            pattern TEXT NOT NULL,
            action TEXT NOT NULL,
            match_count INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS rule_match (
            rule_id INTEGER NOT NULL,
            bounce_id INTEGER NOT NULL,
            PRIMARY KEY (rule_id, bounce_id)
        );

        CREATE TABLE IF NOT EXISTS subscriber (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            confirmed INTEGER NOT NULL DEFAULT 0,
            blacklisted INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            bounce_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS subscriber_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscriber_id INTEGER NOT NULL,
            summary TEXT NOT NULL,
            detail TEXT NOT NULL,
            created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blacklist (
            email TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            added TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS process_lock (
            name TEXT PRIMARY KEY,
            pid INTEGER NOT NULL,
            started TEXT NOT NULL
        );",
    )
    .context("Failed to initialize database schema")?;
    Ok(())
}
