// ABOUTME: The revkv event log: revision-ordered append/list/watch over a pluggable SQL dialect.
// ABOUTME: Provides the Broadcaster fan-out utility and SqlLog with its poll and compaction loops.

pub mod broadcaster;
pub mod sqllog;

pub use broadcaster::Broadcaster;
pub use sqllog::{COMPACT_REV_KEY, ListResult, Log, SqlLog};
