// ABOUTME: SqlLog, the revision-ordered watchable event log over a SQL dialect.
// ABOUTME: Runs the poll loop (gap skip-then-fill) and the periodic compactor as background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use revkv_core::{Dialect, Error, Event, KeyValue, Result, rows_to_events};

use crate::broadcaster::Broadcaster;

/// Sentinel key whose previous-revision link records the compaction cursor.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

const POLL_BATCH_SIZE: i64 = 500;
const COMPACT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const COMPACT_MIN_RETAIN: i64 = 1000;
/// How long a revision gap may stand before a synthetic fill is attempted.
const GAP_FILL_AFTER: Duration = Duration::from_secs(1);
/// Per-watcher delivery buffer; the relay task blocks when a consumer
/// falls this far behind.
const WATCH_BUFFER: usize = 100;
/// Wake-up hint buffer; hints are dropped when full.
const NOTIFY_BUFFER: usize = 1024;

/// Result of a revision-addressed read.
///
/// `compacted` reports that the requested revision is older than the
/// oldest consistently retained one; the rows that could still be read
/// are returned alongside it so the caller can decide how to react.
/// This is the explicit form of returning data together with an error.
#[derive(Debug, Default)]
pub struct ListResult {
    pub revision: i64,
    pub compacted: bool,
    pub events: Vec<Event>,
}

impl ListResult {
    /// Treat a compacted read as the error it is to most callers.
    pub fn into_events(self) -> Result<(i64, Vec<Event>)> {
        if self.compacted {
            return Err(Error::Compacted);
        }
        Ok((self.revision, self.events))
    }
}

/// The event-log abstraction the logical KV store is built on.
#[async_trait]
pub trait Log: Send + Sync + 'static {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    async fn current_revision(&self) -> Result<i64>;
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> Result<ListResult>;
    async fn after(&self, prefix: &str, revision: i64, limit: i64) -> Result<ListResult>;
    async fn watch(&self, prefix: &str) -> mpsc::Receiver<Vec<Event>>;
    async fn count(&self, prefix: &str) -> Result<(i64, i64)>;
    async fn append(&self, event: Event) -> Result<i64>;
}

/// A revision-addressable, watchable event stream over a SQL dialect.
///
/// Cheap to clone; all clones share the same poller, compactor, and
/// subscriber set. Background work starts lazily with the first watcher
/// and stops when `stop` is called (or every watcher goes away).
#[derive(Clone)]
pub struct SqlLog {
    inner: Arc<Inner>,
}

struct Inner {
    dialect: Arc<dyn Dialect>,
    broadcaster: Broadcaster<Vec<Event>>,
    notify_tx: mpsc::Sender<i64>,
    /// Held here between poll-loop runs; the running poll loop owns it.
    notify_rx: std::sync::Mutex<Option<mpsc::Receiver<i64>>>,
    shutdown: watch::Sender<bool>,
    compactor_running: AtomicBool,
}

impl SqlLog {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                dialect,
                broadcaster: Broadcaster::new(),
                notify_tx,
                notify_rx: std::sync::Mutex::new(Some(notify_rx)),
                shutdown,
                compactor_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.inner.dialect
    }

    /// Non-blocking wake-up hint for the poll loop; dropped when the
    /// buffer is full, since a hint carries no data.
    fn notify(&self, revision: i64) {
        let _ = self.inner.notify_tx.try_send(revision);
    }

    /// Resolve the compaction sentinel on startup: create it if absent,
    /// and if a historical bug left more than one, keep the row with
    /// the highest previous-revision link and delete the rest.
    async fn compact_start(&self) -> Result<()> {
        let rows = self.inner.dialect.after(COMPACT_REV_KEY, 0, 0).await?;
        let (_, _, events) = rows_to_events(rows);

        if events.is_empty() {
            self.append(Event {
                create: true,
                kv: KeyValue {
                    key: COMPACT_REV_KEY.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await?;
            return Ok(());
        }
        if events.len() == 1 {
            return Ok(());
        }

        let mut max_rev = 0;
        let mut keep = 0;
        for event in &events {
            if event.prev_revision() > max_rev {
                max_rev = event.prev_revision();
                keep = event.kv.mod_revision;
            }
        }
        for event in &events {
            if event.kv.mod_revision == keep {
                continue;
            }
            self.inner
                .dialect
                .delete_revision(event.kv.mod_revision)
                .await?;
        }
        Ok(())
    }

    /// One full compaction pass: walk the persisted cursor up to 1000
    /// revisions behind `end`, deleting superseded rows and tombstones,
    /// advancing the cursor transactionally as it goes. Returns the new
    /// cursor. Safe to call at any time; errors abort the pass and the
    /// next one resumes from the committed cursor.
    pub async fn compact_once(&self) -> Result<i64> {
        let end = self.inner.dialect.current_revision().await?;
        self.compact_to(end - COMPACT_MIN_RETAIN).await
    }

    /// Compact history up to and including `end`, regardless of the
    /// retain window. The periodic compactor uses the windowed
    /// `compact_once`; this is the manual entry point.
    pub async fn compact_to(&self, end: i64) -> Result<i64> {
        let dialect = &self.inner.dialect;
        let mut cursor = dialect.get_compact_revision().await?;
        if cursor >= end {
            return Ok(cursor);
        }

        tracing::debug!(cursor, end, "compaction pass starting");
        let mut deleted = 0usize;
        for rev in cursor..=end {
            let rows = dialect.get_revision(rev).await?;
            let (_, _, events) = rows_to_events(rows);
            let Some(event) = events.first() else {
                continue;
            };
            if event.kv.key == COMPACT_REV_KEY {
                continue;
            }

            let mut deletes = Vec::new();
            // This row superseded an older one; the older row is no
            // longer needed for any consistent read at or above rev.
            if event.prev_revision() != 0 {
                deletes.push(event.prev_revision());
            }
            // A tombstone past the retain window can go too.
            if event.delete {
                deletes.push(rev);
            }
            if !deletes.is_empty() {
                dialect.compact_apply(rev, &deletes).await?;
                deleted += deletes.len();
                cursor = rev;
            }
        }

        if cursor != end + 1 {
            dialect.set_compact_revision(end + 1).await?;
            cursor = end + 1;
        }
        tracing::debug!(deleted, cursor, "compaction pass finished");
        Ok(cursor)
    }

    /// Periodic compaction driver. Each tick compacts up to the current
    /// revision observed on the previous tick, always leaving the most
    /// recent 1000 revisions untouched. Errors abort the tick only.
    async fn compactor(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // Stop may have been signalled before this task was scheduled.
        if *shutdown.borrow() {
            return;
        }
        let mut next_end = match self.inner.dialect.current_revision().await {
            Ok(rev) => rev,
            Err(err) => {
                tracing::error!("failed to read current revision at compactor start: {err}");
                0
            }
        };
        let mut ticker = tokio::time::interval_at(
            Instant::now() + COMPACT_INTERVAL,
            COMPACT_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            let end = next_end - COMPACT_MIN_RETAIN;
            match self.inner.dialect.current_revision().await {
                Ok(rev) => next_end = rev,
                Err(err) => {
                    tracing::error!("failed to get current revision: {err}");
                    continue;
                }
            }
            if let Err(err) = self.compact_to(end).await {
                tracing::error!("compaction failed: {err}");
            }
        }
    }

    /// Connect the watch pipeline: spawn the compactor (once) and the
    /// poll loop, starting at the compaction floor so a fresh watcher
    /// can observe the oldest retained history without racing the
    /// compactor into a gap.
    async fn start_watch(&self) -> Result<mpsc::Receiver<Vec<Event>>> {
        let poll_start = self.inner.dialect.get_compact_revision().await?;

        // A previous poll loop may still be winding down after its last
        // watcher left; it hands the receiver back as it exits.
        let notify_rx = loop {
            let taken = self
                .inner
                .notify_rx
                .lock()
                .expect("notify receiver lock poisoned")
                .take();
            match taken {
                Some(rx) => break rx,
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        if !self.inner.compactor_running.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.clone().compactor());
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(self.clone().poll(tx, poll_start, notify_rx));
        Ok(rx)
    }

    /// The poll loop: turns raw inserted rows into ordered, gap-free
    /// batches. Runs until shutdown or until the fan-out pump goes away,
    /// at which point the notify receiver is handed back for a restart.
    async fn poll(
        self,
        result: mpsc::Sender<Vec<Event>>,
        poll_start: i64,
        mut notify: mpsc::Receiver<i64>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut last = poll_start;
        let mut skip: i64 = 0;
        let mut skip_time = Instant::now();
        let mut fill_attempted: i64 = 0;
        let mut wait_for_more = true;
        let poll_period = Duration::from_secs(1);
        let mut ticker = tokio::time::interval_at(Instant::now() + poll_period, poll_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'outer: loop {
            // Stop may have been signalled before this task first ran,
            // in which case the subscription above never fires.
            if *shutdown.borrow() {
                break;
            }
            if wait_for_more {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break 'outer,
                        // The fan-out pump dropped its receiver (last
                        // watcher left); wind down promptly so a new
                        // watcher can restart the loop.
                        _ = result.closed() => break 'outer,
                        check = notify.recv() => match check {
                            // Sender half lives in Inner, so this only
                            // closes when the whole log is dropped.
                            None => break 'outer,
                            Some(rev) if rev <= last => continue,
                            Some(_) => break,
                        },
                        _ = ticker.tick() => break,
                    }
                }
            }
            wait_for_more = true;

            let rows = match self.inner.dialect.after("%", last, POLL_BATCH_SIZE).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!("failed to list latest changes: {err}");
                    continue;
                }
            };
            let (_, _, events) = rows_to_events(rows);
            if events.is_empty() {
                continue;
            }
            // A large batch suggests there is more waiting; drain again
            // without sleeping.
            wait_for_more = events.len() < 100;

            let mut rev = last;
            let mut sequential = Vec::new();
            let mut advanced = false;

            for event in events {
                let next = rev + 1;
                if event.kv.mod_revision != next {
                    // Revisions must be delivered strictly sequentially;
                    // skipping one here would lose it for every watcher.
                    tracing::trace!(
                        expected = next,
                        got = event.kv.mod_revision,
                        "revision gap"
                    );
                    if skip != next {
                        // First sighting: remember it and retry quickly,
                        // most out-of-order commits resolve in well under
                        // a second.
                        skip = next;
                        skip_time = Instant::now();
                        self.notify(next);
                        break;
                    } else if skip_time.elapsed() < GAP_FILL_AFTER {
                        // Still inside the skip window; the 1s ticker
                        // will retry without spinning against the db.
                        break;
                    } else if fill_attempted != next {
                        // The gap has stood too long; occupy the slot
                        // with a synthetic row so sequencing can proceed.
                        // A fill that loses to the real insert fails on
                        // the primary key and resolves as a normal row.
                        fill_attempted = next;
                        match self.inner.dialect.fill(next).await {
                            Ok(()) => {
                                tracing::trace!(revision = next, "filled gap");
                                self.notify(next);
                            }
                            Err(err) => {
                                tracing::trace!(revision = next, "fill failed: {err}");
                            }
                        }
                        break;
                    } else {
                        // Neither the row nor the fill ever landed. Log
                        // the anomaly and move on; the log must not
                        // wedge forever on one missing revision.
                        tracing::error!(
                            key = %event.kv.key,
                            revision = event.kv.mod_revision,
                            expected = next,
                            "unresolved revision gap, skipping"
                        );
                    }
                }

                advanced = true;
                rev = event.kv.mod_revision;
                if self.inner.dialect.is_fill(&event.kv.key) {
                    tracing::trace!(revision = rev, "suppressing fill row");
                } else {
                    sequential.push(event);
                }
            }

            // Only move `last` forward together with delivery, so a
            // failed send never silently consumes revisions.
            if advanced {
                last = rev;
                if !sequential.is_empty() && result.send(sequential).await.is_err() {
                    // Fan-out pump is gone (no watchers left).
                    break;
                }
            }
        }

        // Hand the notify receiver back so the next watcher can restart
        // the loop from wherever the log has advanced to.
        *self
            .inner
            .notify_rx
            .lock()
            .expect("notify receiver lock poisoned") = Some(notify);
    }

    fn filter(events: &[Event], check_prefix: bool, prefix: &str) -> Vec<Event> {
        events
            .iter()
            .filter(|e| {
                (check_prefix && e.kv.key.starts_with(prefix)) || e.kv.key == prefix
            })
            .cloned()
            .collect()
    }
}

/// Convert a trailing-`/` hierarchical prefix into a SQL LIKE pattern.
fn like_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        format!("{prefix}%")
    } else {
        prefix.to_string()
    }
}

#[async_trait]
impl Log for SqlLog {
    /// Must be called once before any other operation; resolves the
    /// compaction sentinel. Watch machinery starts lazily later.
    async fn start(&self) -> Result<()> {
        self.compact_start().await
    }

    /// Stop all background work. Watch channels close as the poll loop,
    /// pump, and relays unwind. `send_replace` records the signal even
    /// when no task has subscribed yet; tasks check the flag as soon as
    /// they do.
    async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
    }

    async fn current_revision(&self) -> Result<i64> {
        self.inner.dialect.current_revision().await
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> Result<ListResult> {
        let mut start_key = start_key;
        let pattern;
        if prefix.ends_with('/') {
            // On a fresh listing the start key is the prefix itself and
            // no such row exists; drop it.
            if prefix == start_key {
                start_key = "";
            }
            pattern = format!("{prefix}%");
        } else {
            // Not a hierarchical listing, so pagination does not apply.
            start_key = "";
            pattern = prefix.to_string();
        }

        let rows = if revision == 0 {
            self.inner
                .dialect
                .list_current(&pattern, limit, include_deleted)
                .await?
        } else {
            self.inner
                .dialect
                .list(&pattern, start_key, limit, revision, include_deleted)
                .await?
        };

        let (rev, mut compact, events) = rows_to_events(rows);
        if revision > 0 && events.is_empty() {
            // An empty result carries no bookkeeping columns; fetch the
            // compaction floor explicitly before judging the revision.
            compact = self.inner.dialect.get_compact_revision().await?;
        }

        self.notify(rev);
        Ok(ListResult {
            revision: rev,
            compacted: revision > 0 && revision < compact,
            events,
        })
    }

    async fn after(&self, prefix: &str, revision: i64, limit: i64) -> Result<ListResult> {
        let pattern = like_prefix(prefix);
        let rows = self.inner.dialect.after(&pattern, revision, limit).await?;
        let (rev, compact, events) = rows_to_events(rows);
        Ok(ListResult {
            revision: rev,
            compacted: revision > 0 && revision < compact,
            events,
        })
    }

    /// Subscribe to ordered event batches under `prefix`. The returned
    /// channel closes on shutdown. Batches that filter to empty for
    /// this prefix are not delivered.
    async fn watch(&self, prefix: &str) -> mpsc::Receiver<Vec<Event>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        let log = self.clone();
        let subscription = self
            .inner
            .broadcaster
            .subscribe(|| async move { log.start_watch().await })
            .await;
        let mut feed = match subscription {
            Ok(feed) => feed,
            Err(err) => {
                tracing::error!("failed to start watch: {err}");
                return rx;
            }
        };

        let check_prefix = prefix.ends_with('/');
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(events) => {
                        let filtered = Self::filter(&events, check_prefix, &prefix);
                        if !filtered.is_empty() && tx.send(filtered).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Deliberate backpressure policy: a slow watcher
                        // skips ahead instead of stalling the poller.
                        tracing::error!(missed = n, prefix = %prefix, "watcher lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        rx
    }

    async fn count(&self, prefix: &str) -> Result<(i64, i64)> {
        self.inner.dialect.count(&like_prefix(prefix)).await
    }

    /// Insert one event, returning its assigned revision and waking the
    /// poll loop. A dialect conflict surfaces verbatim; the KV layer
    /// interprets it as a lost CAS race.
    async fn append(&self, event: Event) -> Result<i64> {
        let prev_value = event
            .prev_kv
            .as_ref()
            .map(|kv| kv.value.as_slice())
            .unwrap_or_default();
        let rev = self
            .inner
            .dialect
            .insert(
                &event.kv.key,
                event.create,
                event.delete,
                event.kv.create_revision,
                event.prev_revision(),
                event.kv.lease,
                &event.kv.value,
                prev_value,
            )
            .await?;
        self.notify(rev);
        Ok(rev)
    }
}
