// ABOUTME: SQLite implementation of the revkv Dialect trait via rusqlite.
// ABOUTME: Owns the log table schema, revision-assigning inserts, and compaction bookkeeping.

mod dialect;

pub use dialect::{SqliteDialect, SqliteError};
