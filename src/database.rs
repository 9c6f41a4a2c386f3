//! Database handle: connection pool, schema bootstrap, and collection
//! lifecycle.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::index::{self, REGISTRY_TABLE};

pub(crate) type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// A handle to one SQLite-backed document store. Cheap to clone; clones
/// share the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(10).build(manager)?;
        let db = Self { pool };
        db.init_schema()?;
        info!(path = %path.display(), "opened document store");
        Ok(db)
    }

    /// An in-memory store, mainly for tests. The pool holds a single
    /// connection so every caller sees the same database.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                fields TEXT NOT NULL,
                uniq INTEGER NOT NULL DEFAULT 0,
                fts INTEGER NOT NULL DEFAULT 0,
                tokenizer TEXT,
                PRIMARY KEY (collection, name)
            );"
        ))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Get a collection handle, creating its table on first use.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        validate_collection_name(name)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    data TEXT NOT NULL
                )"
            ),
            [],
        )?;
        Ok(Collection::new(self.clone(), name.to_string()))
    }

    /// Names of all collections in the store, excluding internal tables and
    /// index artifacts. FTS tables and their shadow tables are identified
    /// through the index registry, not by name pattern, so a collection
    /// whose own name happens to contain `_fts` still shows up.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT name FROM {REGISTRY_TABLE} WHERE fts = 1"
        ))?;
        let fts_tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table'
               AND name NOT LIKE 'sqlite_%'
               AND name NOT LIKE '\\_%' ESCAPE '\\'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            let name: String = row?;
            // an FTS virtual table brings shadow tables named <fts>_data,
            // <fts>_idx, <fts>_content, <fts>_docsize, <fts>_config
            let is_index_artifact = fts_tables
                .iter()
                .any(|t| name == *t || name.starts_with(&format!("{t}_")));
            if !is_index_artifact {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop a collection, its indexes, and its rows. Irreversible.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        let conn = self.conn()?;
        index::drop_indexes(&conn, name)?;
        conn.execute(&format!("DROP TABLE IF EXISTS \"{name}\""), [])?;
        debug!(collection = name, "dropped collection");
        Ok(())
    }
}

/// Collection names become table names, so the charset is restricted up
/// front. Leading underscores are reserved for internal tables.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && !name.starts_with(char::is_numeric)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCollectionName(name.to_string()))
    }
}

/// Run `f` inside a savepoint: released on success, rolled back on error.
pub(crate) fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(err) => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
            Err(err)
        }
    }
}
