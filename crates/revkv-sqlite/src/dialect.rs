// ABOUTME: The rusqlite-backed Dialect: one log table with revision-assigning inserts.
// ABOUTME: Translates unique-index races into KeyExists and applies compaction steps transactionally.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tokio::sync::Mutex;

use revkv_core::{Dialect, Error, Result, Row};

/// Key prefix used for synthetic gap-fill rows.
const FILL_PREFIX: &str = "gap-";

/// Sentinel key whose `prev_revision` column stores the compaction cursor.
const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Column list shared by every read query, in the fixed Row order
/// (minus the two leading bookkeeping columns each query adds).
const COLUMNS: &str = "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, \
                       kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// Subquery for the latest assigned revision.
const REV_SQL: &str = "SELECT MAX(rkv.id) FROM revkv AS rkv";

/// Subquery for the persisted compaction cursor.
const COMPACT_REV_SQL: &str = "SELECT MAX(crkv.prev_revision) FROM revkv AS crkv \
                               WHERE crkv.name = 'compact_rev_key'";

/// Errors local to the SQLite dialect.
#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A revkv dialect backed by a single rusqlite connection.
///
/// The connection is serialized behind an async mutex; SQLite itself
/// provides the transactional guarantees the event log relies on
/// (atomic revision assignment, all-or-nothing compaction steps).
pub struct SqliteDialect {
    conn: Mutex<Connection>,
}

impl SqliteDialect {
    /// Open or create the log database at the given path and ensure the
    /// schema exists.
    pub fn open(path: &Path) -> std::result::Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Open a private in-memory database, for tests and scratch use.
    pub fn open_in_memory() -> std::result::Result<Self, SqliteError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> std::result::Result<Self, SqliteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS revkv (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                created INTEGER,
                deleted INTEGER,
                create_revision INTEGER,
                prev_revision INTEGER,
                lease INTEGER,
                value BLOB,
                old_value BLOB
            );
            CREATE INDEX IF NOT EXISTS revkv_name_index ON revkv (name);
            CREATE UNIQUE INDEX IF NOT EXISTS revkv_name_prev_revision_uindex
                ON revkv (name, prev_revision);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Listing query joined against the newest row per key. `extra` is
    /// an additional predicate on the inner max-per-key subquery.
    fn list_sql(extra: &str, limit: i64) -> String {
        let mut sql = format!(
            "SELECT ({REV_SQL}), ({COMPACT_REV_SQL}), {COLUMNS}
             FROM revkv AS kv
             JOIN (
                 SELECT MAX(mkv.id) AS id
                 FROM revkv AS mkv
                 WHERE mkv.name LIKE ?1 {extra}
                 GROUP BY mkv.name) AS maxkv
             ON maxkv.id = kv.id
             WHERE (kv.deleted = 0 OR ?2)
             ORDER BY kv.id ASC"
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

/// Decode one result row in the fixed column order.
fn scan(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(Row {
        current_revision: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
        compact_revision: row.get(1)?,
        mod_revision: row.get(2)?,
        key: row.get(3)?,
        created: row.get(4)?,
        deleted: row.get(5)?,
        create_revision: row.get(6)?,
        prev_revision: row.get(7)?,
        lease: row.get(8)?,
        value: row.get::<_, Option<Vec<u8>>>(9)?.unwrap_or_default(),
        prev_value: row.get(10)?,
    })
}

/// Map rusqlite failures into the shared taxonomy. A violation of the
/// `(name, prev_revision)` unique index means a concurrent writer
/// superseded the same previous revision first.
fn translate(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::KeyExists;
        }
    }
    Error::Backend(anyhow::Error::new(SqliteError::Sqlite(err)))
}

fn collect(stmt: &mut rusqlite::Statement<'_>, args: impl rusqlite::Params) -> Result<Vec<Row>> {
    let rows = stmt
        .query_map(args, scan)
        .map_err(translate)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(translate)?;
    Ok(rows)
}

#[async_trait]
impl Dialect for SqliteDialect {
    async fn list_current(
        &self,
        prefix: &str,
        limit: i64,
        include_deleted: bool,
    ) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        let sql = Self::list_sql("", limit);
        let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
        collect(&mut stmt, params![prefix, include_deleted])
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        if start_key.is_empty() {
            let sql = Self::list_sql("AND mkv.id <= ?3", limit);
            let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
            collect(&mut stmt, params![prefix, include_deleted, revision])
        } else {
            // Resume after start_key: restrict to rows newer than the
            // newest row for that key, still bounded by the revision.
            let sql = Self::list_sql(
                "AND mkv.id <= ?3 AND mkv.id > (
                     SELECT MAX(ikv.id) FROM revkv AS ikv
                     WHERE ikv.name = ?4 AND ikv.id <= ?3)",
                limit,
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
            collect(&mut stmt, params![prefix, include_deleted, revision, start_key])
        }
    }

    async fn count(&self, prefix: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT ({REV_SQL}), COUNT(c.id) FROM ({}) AS c",
            Self::list_sql("", 0)
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
        stmt.query_row(params![prefix, false], |row| {
            Ok((row.get::<_, Option<i64>>(0)?.unwrap_or(0), row.get(1)?))
        })
        .map_err(translate)
    }

    async fn current_revision(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("SELECT ({REV_SQL})"), [], |row| {
            Ok(row.get::<_, Option<i64>>(0)?.unwrap_or(0))
        })
        .map_err(translate)
    }

    async fn after(&self, prefix: &str, revision: i64, limit: i64) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        let mut sql = format!(
            "SELECT ({REV_SQL}), ({COMPACT_REV_SQL}), {COLUMNS}
             FROM revkv AS kv
             WHERE kv.name LIKE ?1 AND kv.id > ?2
             ORDER BY kv.id ASC"
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
        collect(&mut stmt, params![prefix, revision])
    }

    async fn insert(
        &self,
        key: &str,
        create: bool,
        delete: bool,
        create_revision: i64,
        prev_revision: i64,
        ttl: i64,
        value: &[u8],
        prev_value: &[u8],
    ) -> Result<i64> {
        tracing::trace!(key, create, delete, prev_revision, "INSERT");
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO revkv (name, created, deleted, create_revision, prev_revision,
                                   lease, value, old_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 RETURNING id",
            )
            .map_err(translate)?;
        stmt.query_row(
            params![key, create, delete, create_revision, prev_revision, ttl, value, prev_value],
            |row| row.get(0),
        )
        .map_err(translate)
    }

    async fn get_revision(&self, revision: i64) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT 0, NULL, {COLUMNS} FROM revkv AS kv WHERE kv.id = ?1"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(translate)?;
        collect(&mut stmt, params![revision])
    }

    async fn delete_revision(&self, revision: i64) -> Result<()> {
        tracing::trace!(revision, "DELETE REVISION");
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM revkv WHERE id = ?1", params![revision])
            .map_err(translate)?;
        Ok(())
    }

    async fn get_compact_revision(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let rev: Option<i64> = conn
            .query_row(&format!("SELECT ({COMPACT_REV_SQL})"), [], |row| row.get(0))
            .optional()
            .map_err(translate)?
            .flatten();
        Ok(rev.unwrap_or(0))
    }

    async fn set_compact_revision(&self, revision: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE revkv SET prev_revision = ?1 WHERE name = ?2",
            params![revision, COMPACT_REV_KEY],
        )
        .map_err(translate)?;
        Ok(())
    }

    async fn compact_apply(&self, cursor: i64, revisions: &[i64]) -> Result<()> {
        tracing::trace!(cursor, deletes = revisions.len(), "COMPACT APPLY");
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(translate)?;
        tx.execute(
            "UPDATE revkv SET prev_revision = ?1 WHERE name = ?2",
            params![cursor, COMPACT_REV_KEY],
        )
        .map_err(translate)?;
        for revision in revisions {
            tx.execute("DELETE FROM revkv WHERE id = ?1", params![revision])
                .map_err(translate)?;
        }
        tx.commit().map_err(translate)?;
        Ok(())
    }

    async fn fill(&self, revision: i64) -> Result<()> {
        tracing::trace!(revision, "FILL");
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO revkv (id, name, created, deleted, create_revision, prev_revision,
                               lease, value, old_value)
             VALUES (?1, ?2, 0, 1, 0, 0, 0, NULL, NULL)",
            params![revision, format!("{FILL_PREFIX}{revision}")],
        )
        .map_err(translate)?;
        Ok(())
    }

    fn is_fill(&self, key: &str) -> bool {
        key.starts_with(FILL_PREFIX)
    }
}
