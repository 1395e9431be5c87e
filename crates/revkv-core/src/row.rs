// ABOUTME: The raw row contract between the event log and any SQL dialect.
// ABOUTME: A Row carries the fixed column set every dialect query returns, in a typed struct.

use crate::kv::{Event, KeyValue};

/// One decoded row from the backing table.
///
/// Every dialect read query returns rows in this shape, regardless of
/// engine. Column order in the underlying SQL is fixed:
/// `(current_revision, compact_revision, mod_revision, key, created,
/// deleted, create_revision, prev_revision, lease, value, prev_value)`.
/// `current_revision` and `compact_revision` are table-level bookkeeping
/// repeated on every row so a single query yields both the data and the
/// snapshot point it is consistent at.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Latest assigned revision at query time.
    pub current_revision: i64,
    /// Oldest revision still guaranteed consistent; None before the
    /// first compaction.
    pub compact_revision: Option<i64>,
    pub mod_revision: i64,
    pub key: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
}

impl Row {
    /// Decode this row into an event, applying the create fix-ups: a
    /// create's `create_revision` is its own `mod_revision` and it has
    /// no meaningful previous state.
    pub fn into_event(self) -> Event {
        let mut event = Event {
            create: self.created,
            delete: self.deleted,
            kv: KeyValue {
                key: self.key,
                create_revision: self.create_revision,
                mod_revision: self.mod_revision,
                value: self.value,
                lease: self.lease,
            },
            prev_kv: Some(KeyValue {
                mod_revision: self.prev_revision,
                value: self.prev_value.unwrap_or_default(),
                ..Default::default()
            }),
        };
        if event.create {
            event.kv.create_revision = event.kv.mod_revision;
            event.prev_kv = None;
        }
        event
    }
}

/// Decode a batch of rows into `(current_revision, compact_revision, events)`.
///
/// The bookkeeping revisions are taken from the last row; an empty
/// batch yields `(0, 0, [])` and the caller must fetch the compact
/// revision separately if it needs it.
pub fn rows_to_events(rows: Vec<Row>) -> (i64, i64, Vec<Event>) {
    let mut rev = 0;
    let mut compact = 0;
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        rev = row.current_revision;
        compact = row.compact_revision.unwrap_or(0);
        events.push(row.into_event());
    }
    (rev, compact, events)
}
