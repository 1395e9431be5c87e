// ABOUTME: Lazy single-producer, many-consumer fan-out used by the event log's watch path.
// ABOUTME: The producer is connected on first subscribe and torn down when subscribers drop to zero.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};

use revkv_core::Result;

/// Fan-out buffer per subscriber. A subscriber that falls this many
/// batches behind is lagged: it logs an error and resumes from the
/// oldest retained batch rather than stalling the producer.
const BROADCAST_CAPACITY: usize = 1024;

/// Fans one producer channel out to any number of broadcast subscribers.
///
/// The producer is started lazily by the first `subscribe` call via the
/// supplied `connect` future. When every subscriber has gone away the
/// pump task exits and drops the producer channel, which the producer
/// observes as a closed channel; a later subscriber reconnects from
/// scratch.
#[derive(Clone, Default)]
pub struct Broadcaster<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    generation: u64,
    sender: Option<broadcast::Sender<T>>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            sender: None,
        }
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Subscribe to the fan-out, starting the producer if it is not
    /// running. `connect` is only awaited when a new producer is needed.
    pub async fn subscribe<F, Fut>(&self, connect: F) -> Result<broadcast::Receiver<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<mpsc::Receiver<T>>>,
    {
        let mut state = self.inner.lock().await;
        // Reuse a live pump even when its receiver count has hit zero:
        // the pump re-checks the count under this lock before exiting,
        // so a subscriber landing here keeps it alive.
        if let Some(sender) = &state.sender {
            return Ok(sender.subscribe());
        }

        let mut source = connect().await?;
        let (sender, receiver) = broadcast::channel(BROADCAST_CAPACITY);
        state.generation += 1;
        state.sender = Some(sender.clone());
        let generation = state.generation;
        drop(state);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                if sender.send(item).is_err() {
                    // No receivers left. Re-check under the lock so a
                    // subscriber that raced in keeps the pump alive.
                    let mut state = inner.lock().await;
                    if sender.receiver_count() > 0 {
                        continue;
                    }
                    if state.generation == generation {
                        state.sender = None;
                    }
                    return;
                }
            }
            // Producer closed (shutdown); clear so nobody subscribes to
            // a dead channel.
            let mut state = inner.lock().await;
            if state.generation == generation {
                state.sender = None;
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn first_subscriber_connects_producer_once() {
        let b: Broadcaster<i64> = Broadcaster::new();
        let connects = Arc::new(AtomicUsize::new(0));

        let (tx, rx_src) = mpsc::channel(8);
        let connects2 = Arc::clone(&connects);
        let mut rx1 = b
            .subscribe(move || async move {
                connects2.fetch_add(1, Ordering::SeqCst);
                Ok(rx_src)
            })
            .await
            .unwrap();
        let mut rx2 = b
            .subscribe(|| async { panic!("second subscribe must reuse the producer") })
            .await
            .unwrap();

        tx.send(7).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), 7);
        assert_eq!(rx2.recv().await.unwrap(), 7);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_close_when_producer_ends() {
        let b: Broadcaster<i64> = Broadcaster::new();
        let (tx, rx_src) = mpsc::channel(8);
        let mut rx = b.subscribe(|| async { Ok(rx_src) }).await.unwrap();

        tx.send(1).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
        drop(tx);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn resubscribe_reuses_pump_before_it_notices_the_drop() {
        let b: Broadcaster<i64> = Broadcaster::new();
        let (tx, rx_src) = mpsc::channel(8);
        let rx = b.subscribe(|| async { Ok(rx_src) }).await.unwrap();

        // Nothing has been sent, so the pump is parked and has not yet
        // observed the receiver count hitting zero.
        drop(rx);
        let mut rx = b
            .subscribe(|| async { panic!("live pump must be reused, not reconnected") })
            .await
            .unwrap();

        tx.send(9).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn reconnects_after_all_subscribers_drop() {
        let b: Broadcaster<i64> = Broadcaster::new();

        let (tx1, rx_src1) = mpsc::channel(8);
        let rx = b.subscribe(|| async { Ok(rx_src1) }).await.unwrap();
        drop(rx);

        // Push until the pump notices there are no receivers and exits.
        loop {
            if tx1.send(0).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let (tx2, rx_src2) = mpsc::channel(8);
        let mut rx = b.subscribe(|| async { Ok(rx_src2) }).await.unwrap();
        tx2.send(42).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 42);
    }
}
