// ABOUTME: The Dialect trait, the seam between the event log and a concrete SQL engine.
// ABOUTME: A dialect owns the table schema, prepared statements, and transactional guarantees.

use async_trait::async_trait;

use crate::Result;
use crate::row::Row;

/// Table accessor implemented once per SQL engine.
///
/// The dialect is responsible for atomic revision assignment on insert
/// and for the transactional semantics of `compact_apply`. Prefixes are
/// already in SQL `LIKE` form when they reach the dialect (the event
/// log converts a trailing `/` into a `%` wildcard).
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Latest state of every key matching `prefix`. `limit <= 0` means
    /// unlimited. Deleted keys are included only when `include_deleted`.
    async fn list_current(&self, prefix: &str, limit: i64, include_deleted: bool)
    -> Result<Vec<Row>>;

    /// Point-in-time listing at `revision`, optionally resuming after
    /// `start_key` for pagination.
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> Result<Vec<Row>>;

    /// `(current_revision, count)` of live keys matching `prefix`.
    async fn count(&self, prefix: &str) -> Result<(i64, i64)>;

    /// The latest assigned revision.
    async fn current_revision(&self) -> Result<i64>;

    /// All rows with revision strictly greater than `revision`, ordered
    /// ascending. `limit <= 0` means unlimited.
    async fn after(&self, prefix: &str, revision: i64, limit: i64) -> Result<Vec<Row>>;

    /// Insert one row and atomically assign it the next revision, which
    /// is returned. A write that races a concurrent supersession of the
    /// same previous revision fails with `Error::KeyExists`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<i64>;

    /// The row at exactly `revision`, if it exists.
    async fn get_revision(&self, revision: i64) -> Result<Vec<Row>>;

    /// Remove the row at `revision`.
    async fn delete_revision(&self, revision: i64) -> Result<()>;

    /// Read the persisted compaction cursor (0 if never compacted).
    async fn get_compact_revision(&self) -> Result<i64>;

    /// Persist the compaction cursor.
    async fn set_compact_revision(&self, revision: i64) -> Result<()>;

    /// Atomically delete `revisions` and advance the compaction cursor
    /// to `cursor`, in one transaction. A crash either applies the whole
    /// step or none of it, so compaction resumes from the last committed
    /// cursor.
    async fn compact_apply(&self, cursor: i64, revisions: &[i64]) -> Result<()>;

    /// Insert a synthetic placeholder at exactly `revision` to close a
    /// sequence gap. Fails if the revision has been taken in the
    /// meantime, which callers treat as the gap resolving itself.
    async fn fill(&self, revision: i64) -> Result<()>;

    /// Whether `key` names a fill placeholder rather than real data.
    fn is_fill(&self, key: &str) -> bool;
}
