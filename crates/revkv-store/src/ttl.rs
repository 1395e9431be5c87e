// ABOUTME: Naive per-key TTL expiry for the KV store.
// ABOUTME: Rediscovers leased keys on startup, watches for new ones, and CAS-deletes on expiry.

use std::time::Duration;

use revkv_core::{KeyValue, Result};
use revkv_log::Log;

use crate::store::{LogStructured, SCAN_PAGE};

// No renewal protocol and no persistence of pending timers. A restart
// rediscovers current leased keys and re-arms timers from scratch,
// which can extend but never truncate an expiry window.
impl<L: Log> LogStructured<L> {
    pub(crate) async fn ttl_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // Stop may have been signalled before this task was scheduled.
        if *shutdown.borrow() {
            return;
        }

        match self.scan_leased().await {
            Ok(leased) => {
                for kv in leased {
                    self.schedule_expiry(kv);
                }
            }
            Err(err) => {
                tracing::error!("failed to scan leased keys at startup: {err}");
            }
        }

        let mut live = self.inner.log.watch("/").await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                batch = live.recv() => {
                    let Some(events) = batch else { return };
                    for event in events {
                        if !event.delete && event.kv.lease > 0 {
                            self.schedule_expiry(event.kv);
                        }
                    }
                }
            }
        }
    }

    /// Page through all current keys and return those carrying a lease.
    async fn scan_leased(&self) -> Result<Vec<KeyValue>> {
        let mut leased = Vec::new();
        let outcome = self.inner.log.list("/", "", SCAN_PAGE, 0, false).await?;
        let revision = outcome.revision;
        let mut events = outcome.events;
        while !events.is_empty() {
            let last_key = events[events.len() - 1].kv.key.clone();
            for event in events {
                if event.kv.lease > 0 {
                    leased.push(event.kv);
                }
            }
            events = self
                .inner
                .log
                .list("/", &last_key, SCAN_PAGE, revision, false)
                .await?
                .events;
        }
        Ok(leased)
    }

    /// Arm a timer for one leased key. The delete is CAS-bound to the
    /// revision the lease was seen at, so a key refreshed or re-created
    /// in the meantime is left alone.
    fn schedule_expiry(&self, kv: KeyValue) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut shutdown = store.inner.shutdown.subscribe();
            if *shutdown.borrow() {
                return;
            }
            // Clamp so a non-positive lease fires immediately instead
            // of wrapping into an effectively infinite sleep.
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(kv.lease.max(0) as u64)) => {}
            }
            let _guard = store.inner.expire_lock.lock().await;
            tracing::debug!(key = %kv.key, revision = kv.mod_revision, "lease expired");
            if let Err(err) = store.delete(&kv.key, kv.mod_revision).await {
                tracing::error!(key = %kv.key, "failed to expire key: {err}");
            }
        });
    }
}
