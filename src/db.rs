//! SQLite persistence shared by the stores.
//!
//! The connection lives behind a mutex that is held only for the duration of
//! a single statement or transaction. Schema migrations are embedded and
//! applied once, in order, when the database is opened.

use crate::error::{MockError, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                expression TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 0,
                headers TEXT NOT NULL DEFAULT '',
                subsystem TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL DEFAULT '',
                subsystem TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS scenario_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_number INTEGER NOT NULL,
                value INTEGER NOT NULL,
                trigger_id INTEGER NOT NULL,
                step_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scenario_steps_trigger ON scenario_steps(trigger_id);
        "#,
    },
    Migration {
        version: 2,
        name: "template_bindings",
        sql: "ALTER TABLE templates ADD COLUMN bindings TEXT NOT NULL DEFAULT '{}';",
    },
];

/// Handle to the SQLite database.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) a database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Database connection established");
        Self::bootstrap(conn)
    }

    /// Private in-memory database, used by tests and throwaway runs.
    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(mut conn: Connection) -> Result<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection. Never hold the guard across an `.await`.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written;
        // the connection stays usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Highest applied schema version, 0 for an empty database.
    pub fn schema_version(&self) -> Result<i64> {
        current_version(&self.conn())
    }
}

fn current_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS version (version INTEGER NOT NULL);")?;
    let current = current_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute("DELETE FROM version", [])?;
        tx.execute("INSERT INTO version (version) VALUES (?1)", params![migration.version])?;
        tx.commit()?;
        info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
    }

    debug!(version = current_version(conn)?, "Schema up to date");
    Ok(())
}

/// Encode trigger headers for the `headers` column.
pub fn encode_headers(headers: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(headers)
        .map_err(|e| MockError::Persistence(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

/// Decode the `headers` column.
///
/// Rows are JSON objects; anything else is read in the legacy
/// `key=value, key=value, ` form, which cannot represent `,` or `=` inside values.
pub fn decode_headers(raw: &str) -> BTreeMap<String, String> {
    if let Ok(headers) = serde_json::from_str::<BTreeMap<String, String>>(raw) {
        return headers;
    }

    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Map a JSON decode failure on column `idx` into a row conversion error.
pub(crate) fn json_column_error(idx: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
