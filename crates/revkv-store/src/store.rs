// ABOUTME: LogStructured, the etcd3-semantics layer over the event log.
// ABOUTME: Hides revision bookkeeping behind Get/Create/Update/Delete/List/Count/Watch.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use revkv_core::{Error, Event, KeyValue, Result};
use revkv_log::Log;

/// Written once at startup so a freshly created store is immediately
/// readable by health probes.
pub const HEALTH_KEY: &str = "/registry/health";
const HEALTH_VALUE: &[u8] = br#"{"health":"true"}"#;

/// Per-watcher delivery buffer at the store surface.
const WATCH_BUFFER: usize = 100;

/// Page size for the startup TTL scan and the count fallback listing.
pub(crate) const SCAN_PAGE: i64 = 1000;

/// An etcd3-like KV store over any `Log`.
///
/// Update and Delete follow the CAS discipline: a revision mismatch is
/// reported as `updated = false` / `deleted = false`, not as an error,
/// and the caller is handed the current state to retry against.
pub struct LogStructured<L: Log> {
    pub(crate) inner: Arc<Inner<L>>,
}

pub(crate) struct Inner<L: Log> {
    pub(crate) log: L,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Serializes the delete-on-expiry action, not detection.
    pub(crate) expire_lock: Mutex<()>,
}

impl<L: Log> Clone for LogStructured<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Log> LogStructured<L> {
    pub fn new(log: L) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                log,
                shutdown,
                expire_lock: Mutex::new(()),
            }),
        }
    }

    pub fn log(&self) -> &L {
        &self.inner.log
    }

    /// Start the store: resolve log bookkeeping, write the health key,
    /// and begin TTL tracking.
    pub async fn start(&self) -> Result<()> {
        self.inner.log.start().await?;
        // The key may survive from an earlier run; that is fine.
        if let Err(err) = self.create(HEALTH_KEY, HEALTH_VALUE, 0).await {
            if !err.is_conflict() {
                return Err(err);
            }
        }
        tokio::spawn(self.clone().ttl_loop());
        Ok(())
    }

    /// Stop background work (TTL timers and everything under the log).
    /// `send_replace` records the signal even when no timer task has
    /// subscribed yet.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.log.stop().await;
    }

    /// Current value of `key`, or at `revision` when non-zero.
    pub async fn get(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>)> {
        let (mut rev, event) = self.get_event(key, revision, false).await?;
        self.adjust_revision(&mut rev).await;
        let kv = event.map(|e| e.kv);
        tracing::debug!(key, revision, rev, found = kv.is_some(), "GET");
        Ok((rev, kv))
    }

    pub(crate) async fn get_event(
        &self,
        key: &str,
        revision: i64,
        include_deleted: bool,
    ) -> Result<(i64, Option<Event>)> {
        let outcome = self
            .inner
            .log
            .list(key, "", 1, revision, include_deleted)
            .await?;
        // A compacted result is fine for a point read; whatever row is
        // still there answers the question.
        let mut rev = outcome.revision;
        if revision != 0 {
            rev = revision;
        }
        Ok((rev, outcome.events.into_iter().next()))
    }

    /// Insert a new key. Fails with `KeyExists` if a live row is
    /// present; a deleted row becomes the previous link so the
    /// supersession chain stays intact for compaction.
    pub async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64> {
        let (rev, prev_event) = self.get_event(key, 0, true).await?;

        let mut create_event = Event {
            create: true,
            kv: KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                lease,
                ..Default::default()
            },
            // Anchoring the previous revision at the read point turns a
            // create/create race into a unique-constraint conflict in
            // the dialect.
            prev_kv: Some(KeyValue {
                mod_revision: rev,
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Some(prev) = prev_event {
            if !prev.delete {
                return Err(Error::KeyExists);
            }
            create_event.prev_kv = Some(prev.kv);
        }

        let rev = self.inner.log.append(create_event).await?;
        tracing::debug!(key, size = value.len(), lease, rev, "CREATE");
        Ok(rev)
    }

    /// Optimistic update. `updated = false` with the current state
    /// means the caller's revision lost the race; retry from there.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool)> {
        let (mut rev, event) = self.get_event(key, 0, false).await?;

        let Some(event) = event else {
            return Ok((0, None, false));
        };
        if event.kv.mod_revision != revision {
            self.adjust_revision(&mut rev).await;
            return Ok((rev, Some(event.kv), false));
        }

        let mut update_event = Event {
            kv: KeyValue {
                key: key.to_string(),
                create_revision: event.kv.create_revision,
                value: value.to_vec(),
                lease,
                ..Default::default()
            },
            prev_kv: Some(event.kv),
            ..Default::default()
        };

        match self.inner.log.append(update_event.clone()).await {
            Ok(new_rev) => {
                update_event.kv.mod_revision = new_rev;
                tracing::debug!(key, revision, rev = new_rev, updated = true, "UPDATE");
                Ok((new_rev, Some(update_event.kv), true))
            }
            Err(err) if err.is_conflict() => {
                // Lost to a concurrent writer between read and append;
                // report the winner's state.
                let (mut rev, event) = self.get_event(key, 0, false).await?;
                self.adjust_revision(&mut rev).await;
                tracing::debug!(key, revision, rev, updated = false, "UPDATE");
                Ok((rev, event.map(|e| e.kv), false))
            }
            Err(err) => Err(err),
        }
    }

    /// Delete with the same CAS discipline; deleting an absent or
    /// already-deleted key is an idempotent success.
    pub async fn delete(
        &self,
        key: &str,
        revision: i64,
    ) -> Result<(i64, Option<KeyValue>, bool)> {
        let (mut rev, event) = self.get_event(key, 0, true).await?;
        self.adjust_revision(&mut rev).await;

        let Some(event) = event else {
            return Ok((rev, None, true));
        };
        if event.delete {
            return Ok((rev, Some(event.kv), true));
        }
        if revision != 0 && event.kv.mod_revision != revision {
            return Ok((rev, Some(event.kv), false));
        }

        let delete_event = Event {
            delete: true,
            kv: event.kv.clone(),
            prev_kv: Some(event.kv.clone()),
            ..Default::default()
        };

        match self.inner.log.append(delete_event).await {
            Ok(new_rev) => {
                tracing::debug!(key, revision, rev = new_rev, deleted = true, "DELETE");
                Ok((new_rev, Some(event.kv), true))
            }
            Err(err) if err.is_conflict() => {
                let (latest_rev, latest) = self.get_event(key, 0, true).await?;
                match latest {
                    Some(latest) => Ok((latest_rev, Some(latest.kv), false)),
                    None => Ok((rev, Some(event.kv), false)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// List keys under a prefix at a fixed revision (0 = current). An
    /// empty current-revision read resolves the revision first and
    /// retries, so the caller's snapshot point cannot race a write.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>)> {
        let mut revision = revision;
        loop {
            let outcome = self
                .inner
                .log
                .list(prefix, start_key, limit, revision, false)
                .await?;
            if outcome.compacted {
                return Err(Error::Compacted);
            }
            if revision == 0 && outcome.events.is_empty() {
                revision = self.inner.log.current_revision().await?;
                continue;
            }

            let rev = if revision != 0 {
                revision
            } else {
                outcome.revision
            };
            let kvs: Vec<KeyValue> = outcome.events.into_iter().map(|e| e.kv).collect();
            tracing::debug!(prefix, start_key, limit, revision, rev, kvs = kvs.len(), "LIST");
            return Ok((rev, kvs));
        }
    }

    /// Count keys under a prefix. A zero fast-path count also carries
    /// revision zero, so recount through the listing path at a fixed
    /// current revision.
    pub async fn count(&self, prefix: &str) -> Result<(i64, i64)> {
        let (rev, count) = self.inner.log.count(prefix).await?;
        if count == 0 {
            let current = self.inner.log.current_revision().await?;
            let (rev, kvs) = self.list(prefix, prefix, SCAN_PAGE, current).await?;
            tracing::debug!(prefix, rev, count = kvs.len(), "COUNT");
            return Ok((rev, kvs.len() as i64));
        }
        tracing::debug!(prefix, rev, count, "COUNT");
        Ok((rev, count))
    }

    /// Watch a prefix starting at `revision` inclusive (0 replays all
    /// retained history). The live subscription is opened before the
    /// backlog read so nothing committed in between is missed; the seam
    /// filter drops anything already delivered.
    pub async fn watch(&self, prefix: &str, revision: i64) -> mpsc::Receiver<Vec<Event>> {
        tracing::debug!(prefix, revision, "WATCH");
        let mut live = self.inner.log.watch(prefix).await;

        let revision = if revision > 0 { revision - 1 } else { revision };
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        let backlog = match self.inner.log.after(prefix, revision, 0).await {
            Ok(outcome) if !outcome.compacted => outcome,
            Ok(_) => {
                tracing::error!(prefix, revision, "watch backlog revision is compacted");
                return rx;
            }
            Err(err) => {
                tracing::error!(prefix, revision, "failed to list watch backlog: {err}");
                return rx;
            }
        };

        tokio::spawn(async move {
            let last_revision = if backlog.events.is_empty() {
                revision
            } else {
                backlog.revision
            };
            if !backlog.events.is_empty() && tx.send(backlog.events).await.is_err() {
                return;
            }

            while let Some(events) = live.recv().await {
                // Events at or below the seam were already delivered in
                // the backlog batch.
                let fresh: Vec<Event> = events
                    .into_iter()
                    .filter(|e| e.kv.mod_revision > last_revision)
                    .collect();
                if !fresh.is_empty() && tx.send(fresh).await.is_err() {
                    return;
                }
            }
        });

        rx
    }

    /// Replace a zero revision with the current one, so callers always
    /// see a usable snapshot point.
    async fn adjust_revision(&self, rev: &mut i64) {
        if *rev != 0 {
            return;
        }
        if let Ok(current) = self.inner.log.current_revision().await {
            *rev = current;
        }
    }
}
