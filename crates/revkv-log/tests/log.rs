// ABOUTME: Integration tests for SqlLog over the real SQLite dialect and a scripted one.
// ABOUTME: Covers ordered gap-free watch delivery, gap fill behavior, and compaction safety.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;

use revkv_core::{Dialect, Event, KeyValue, Result, Row};
use revkv_log::{Log, SqlLog};
use revkv_sqlite::SqliteDialect;

fn put_event(key: &str, value: &[u8], prev: i64) -> Event {
    Event {
        create: prev == 0,
        kv: KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            ..Default::default()
        },
        prev_kv: (prev != 0).then(|| KeyValue {
            mod_revision: prev,
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn sqlite_log() -> SqlLog {
    let dialect = Arc::new(SqliteDialect::open_in_memory().unwrap());
    let log = SqlLog::new(dialect);
    log.start().await.unwrap();
    log
}

#[tokio::test]
async fn append_returns_strictly_increasing_revisions() {
    let log = sqlite_log().await;
    let mut last = 0;
    for i in 0..5 {
        let rev = log
            .append(put_event(&format!("/k{i}"), b"v", 0))
            .await
            .unwrap();
        assert!(rev > last);
        last = rev;
    }
    assert_eq!(log.current_revision().await.unwrap(), last);
}

#[tokio::test]
async fn watch_delivers_ordered_gap_free_batches() {
    let log = sqlite_log().await;
    let mut watch = log.watch("/").await;

    let mut appended = Vec::new();
    for i in 0..4 {
        appended.push(
            log.append(put_event(&format!("/w/{i}"), b"v", 0))
                .await
                .unwrap(),
        );
    }

    let mut seen = Vec::new();
    while seen.len() < appended.len() {
        let batch = timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("watch delivery timed out")
            .expect("watch channel closed early");
        for event in batch {
            seen.push(event.kv.mod_revision);
        }
    }
    assert_eq!(seen, appended);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));

    log.stop().await;
}

#[tokio::test]
async fn watch_filters_by_prefix() {
    let log = sqlite_log().await;
    let mut watch = log.watch("/a/").await;

    log.append(put_event("/b/other", b"x", 0)).await.unwrap();
    log.append(put_event("/a/mine", b"y", 0)).await.unwrap();

    let batch = timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("watch delivery timed out")
        .expect("watch channel closed early");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].kv.key, "/a/mine");

    log.stop().await;
}

#[tokio::test]
async fn stop_closes_watch_channels() {
    let log = sqlite_log().await;
    let mut watch = log.watch("/").await;
    log.stop().await;
    let closed = timeout(Duration::from_secs(5), async {
        while watch.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "watch channel should close on stop");
}

#[tokio::test]
async fn list_reports_compaction_below_the_floor() {
    let log = sqlite_log().await;
    let r1 = log.append(put_event("/a", b"v1", 0)).await.unwrap();
    let r2 = log.append(put_event("/a", b"v2", r1)).await.unwrap();
    log.append(put_event("/b", b"w", 0)).await.unwrap();

    log.compact_to(r2).await.unwrap();

    // the superseded row is gone
    assert!(log.dialect().get_revision(r1).await.unwrap().is_empty());

    // reads at or above the floor still work
    let current = log.list("/", "", 0, 0, false).await.unwrap();
    assert!(!current.compacted);
    let keys: Vec<_> = current.events.iter().map(|e| e.kv.key.clone()).collect();
    assert_eq!(keys, vec!["/a", "/b"]);
    assert_eq!(
        current.events[0].kv.value,
        b"v2",
        "current value survives compaction"
    );

    // reads below the floor are refused
    let stale = log.list("/", "", 0, r1, false).await.unwrap();
    assert!(stale.compacted);
    assert!(stale.into_events().is_err());
}

#[tokio::test]
async fn compaction_prunes_tombstones_but_keeps_sentinel() {
    let log = sqlite_log().await;
    let r1 = log.append(put_event("/a", b"v1", 0)).await.unwrap();
    let mut del = put_event("/a", b"", r1);
    del.create = false;
    del.delete = true;
    let r2 = log.append(del).await.unwrap();

    log.compact_to(r2).await.unwrap();

    // both the superseded row and the tombstone are gone
    assert!(log.dialect().get_revision(r1).await.unwrap().is_empty());
    assert!(log.dialect().get_revision(r2).await.unwrap().is_empty());

    // the compaction sentinel row is never compacted away
    let sentinel = log
        .after(revkv_log::COMPACT_REV_KEY, 0, 0)
        .await
        .unwrap();
    assert_eq!(sentinel.events.len(), 1);

    // deleting an already-deleted key can start fresh
    let r3 = log.append(put_event("/a", b"v2", 0)).await.unwrap();
    assert!(r3 > r2);
}

/// A dialect scripted to expose a revision gap: revision 3 is withheld
/// as if its transaction were slow to commit. In the default shape it
/// never arrives and must be filled; in the late-commit shape the real
/// row lands just before the fill, which then loses on the primary key.
struct GapDialect {
    rows: Mutex<Vec<Row>>,
    late_commit: bool,
    fill_calls: AtomicUsize,
}

impl GapDialect {
    fn new() -> Self {
        Self::scripted(false)
    }

    fn with_late_commit() -> Self {
        Self::scripted(true)
    }

    fn scripted(late_commit: bool) -> Self {
        let mut rows = Vec::new();
        for rev in [1i64, 2, 4, 5] {
            rows.push(Self::row(rev, &format!("/g/{rev}"), false));
        }
        Self {
            rows: Mutex::new(rows),
            late_commit,
            fill_calls: AtomicUsize::new(0),
        }
    }

    fn row(rev: i64, key: &str, deleted: bool) -> Row {
        Row {
            current_revision: 5,
            compact_revision: Some(0),
            mod_revision: rev,
            key: key.to_string(),
            created: true,
            deleted,
            create_revision: rev,
            prev_revision: 0,
            lease: 0,
            value: b"v".to_vec(),
            prev_value: None,
        }
    }
}

#[async_trait]
impl Dialect for GapDialect {
    async fn list_current(&self, _: &str, _: i64, _: bool) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }
    async fn list(&self, _: &str, _: &str, _: i64, _: i64, _: bool) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }
    async fn count(&self, _: &str) -> Result<(i64, i64)> {
        Ok((0, 0))
    }
    async fn current_revision(&self) -> Result<i64> {
        Ok(5)
    }
    async fn after(&self, _: &str, revision: i64, _: i64) -> Result<Vec<Row>> {
        let rows = self.rows.lock().await;
        let mut out: Vec<Row> = rows
            .iter()
            .filter(|r| r.mod_revision > revision)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.mod_revision);
        Ok(out)
    }
    async fn insert(
        &self,
        _: &str,
        _: bool,
        _: bool,
        _: i64,
        _: i64,
        _: i64,
        _: &[u8],
        _: &[u8],
    ) -> Result<i64> {
        unimplemented!("not used by the poll loop")
    }
    async fn get_revision(&self, revision: i64) -> Result<Vec<Row>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|r| r.mod_revision == revision)
            .cloned()
            .collect())
    }
    async fn delete_revision(&self, _: i64) -> Result<()> {
        Ok(())
    }
    async fn get_compact_revision(&self) -> Result<i64> {
        Ok(0)
    }
    async fn set_compact_revision(&self, _: i64) -> Result<()> {
        Ok(())
    }
    async fn compact_apply(&self, _: i64, _: &[i64]) -> Result<()> {
        Ok(())
    }
    async fn fill(&self, revision: i64) -> Result<()> {
        self.fill_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.mod_revision == revision) {
            return Err(anyhow::anyhow!("revision {revision} already present").into());
        }
        if self.late_commit {
            // The slow transaction commits the real row just before the
            // fill reaches the table, taking the primary-key slot.
            rows.push(Self::row(revision, &format!("/g/{revision}"), false));
            return Err(anyhow::anyhow!("revision {revision} already present").into());
        }
        rows.push(Self::row(revision, &format!("gap-{revision}"), true));
        Ok(())
    }
    fn is_fill(&self, key: &str) -> bool {
        key.starts_with("gap-")
    }
}

#[tokio::test]
async fn persistent_gap_is_filled_and_fill_stays_invisible() {
    let log = SqlLog::new(Arc::new(GapDialect::new()));
    let mut watch = log.watch("/").await;

    // Revisions 1 and 2 flow immediately; 3 is missing, so the poller
    // must hold 4 and 5 back, fill 3 after the skip window, and then
    // release 4 and 5 without ever surfacing the fill row.
    let mut seen = Vec::new();
    while seen.len() < 4 {
        let batch = timeout(Duration::from_secs(10), watch.recv())
            .await
            .expect("watch delivery timed out")
            .expect("watch channel closed early");
        for event in batch {
            assert!(!event.kv.key.starts_with("gap-"), "fill row leaked");
            seen.push(event.kv.mod_revision);
        }
    }
    assert_eq!(seen, vec![1, 2, 4, 5]);

    log.stop().await;
}

#[tokio::test]
async fn fill_that_loses_to_a_late_commit_recovers_in_order() {
    let dialect = Arc::new(GapDialect::with_late_commit());
    let log = SqlLog::new(dialect.clone());
    let mut watch = log.watch("/").await;

    // The poller must hold 4 and 5 back behind the missing 3, attempt
    // the fill after the skip window, lose it to the real row, and then
    // deliver the real 3 followed by 4 and 5 with nothing reordered.
    let mut seen = Vec::new();
    while seen.len() < 5 {
        let batch = timeout(Duration::from_secs(10), watch.recv())
            .await
            .expect("watch delivery timed out")
            .expect("watch channel closed early");
        for event in batch {
            seen.push((event.kv.key.clone(), event.kv.mod_revision));
        }
    }
    assert_eq!(
        seen.iter().map(|(_, rev)| *rev).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert!(
        seen.iter().any(|(key, rev)| *rev == 3 && key == "/g/3"),
        "the committed row must flow, not a placeholder"
    );
    assert_eq!(dialect.fill_calls.load(Ordering::SeqCst), 1);

    log.stop().await;
}

#[tokio::test]
async fn rewatch_after_all_watchers_drop_delivers_new_events() {
    let log = sqlite_log().await;

    let mut watch = log.watch("/").await;
    let r1 = log.append(put_event("/r/1", b"v", 0)).await.unwrap();
    let batch = timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("watch delivery timed out")
        .expect("watch channel closed early");
    assert_eq!(batch[0].kv.mod_revision, r1);
    drop(watch);

    // These appends flush the dead relay and, depending on batching,
    // may wind the fan-out pump and poll loop all the way down.
    log.append(put_event("/r/2", b"v", 0)).await.unwrap();
    log.append(put_event("/r/3", b"v", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A fresh watcher must get a live channel either way.
    let mut watch = log.watch("/").await;
    let r4 = log.append(put_event("/r/4", b"v", 0)).await.unwrap();

    let mut seen = Vec::new();
    while !seen.contains(&r4) {
        let batch = timeout(Duration::from_secs(10), watch.recv())
            .await
            .expect("rewatched channel timed out")
            .expect("rewatched channel closed without delivering");
        seen.extend(batch.iter().map(|e| e.kv.mod_revision));
    }

    log.stop().await;
}
