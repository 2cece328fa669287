//! Typed fan-out event bus.
//!
//! Every subscriber owns a bounded delivery channel. `publish` snapshots the
//! subscriber list under a short lock and delivers outside of it, so a slow
//! or stuck subscriber only ever loses its own events.
//!
//! ```text
//! publisher ──► Bus<T> ──┬──► [buffer] ──► subscriber A
//!                        ├──► [buffer] ──► subscriber B (filtered)
//!                        └──► [buffer] ──► subscriber C
//! ```
//!
//! Delivery is at-most-once per subscriber. With `block_on_full = false` a full
//! buffer drops the value immediately; with `block_on_full = true` the publisher
//! waits up to `write_timeout` for that one subscriber before dropping.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Tuning for a [`Bus`].
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Name used in log output.
    pub name: String,
    /// Capacity of each subscriber's delivery channel (minimum 1).
    pub subscriber_buffer_size: usize,
    /// Wait for room in a full buffer instead of dropping right away.
    pub block_on_full: bool,
    /// Upper bound on the wait when `block_on_full` is set.
    pub write_timeout: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            subscriber_buffer_size: 100,
            block_on_full: false,
            write_timeout: Duration::from_millis(100),
        }
    }
}

impl BusOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Result of a single [`Bus::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Subscribers that received the value.
    pub delivered: usize,
    /// Matching subscribers whose buffer stayed full.
    pub dropped: usize,
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    tx: Sender<T>,
    filter: Option<Predicate<T>>,
}

struct BusState<T> {
    closed: bool,
    next_id: u64,
    subscribers: HashMap<u64, Subscriber<T>>,
}

struct BusInner<T> {
    options: BusOptions,
    state: Mutex<BusState<T>>,
    /// Cancelled on close or drop; ends the scope watcher task.
    done: CancellationToken,
}

impl<T> Drop for BusInner<T> {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Fan-out publish/subscribe primitive.
///
/// Cheap to clone; clones share the same subscriber set.
pub struct Bus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Bus<T> {
    /// Create a bus that closes itself when `scope` is cancelled.
    ///
    /// Scope cancellation is observed by a task on the current tokio runtime.
    /// Outside a runtime only an explicit [`Bus::close`] closes the bus.
    pub fn new(scope: &CancellationToken, options: BusOptions) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                options,
                state: Mutex::new(BusState {
                    closed: false,
                    next_id: 0,
                    subscribers: HashMap::new(),
                }),
                done: CancellationToken::new(),
            }),
        };

        if scope.is_cancelled() {
            bus.close();
        } else {
            bus.close_on_cancel(scope.clone());
        }
        bus
    }

    fn close_on_cancel(&self, scope: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let done = self.inner.done.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::select! {
                        _ = scope.cancelled() => {
                            if let Some(inner) = weak.upgrade() {
                                Bus { inner }.close();
                            }
                        }
                        _ = done.cancelled() => {}
                    }
                });
            }
            Err(_) => {
                crate::debug_event!(
                    "bus",
                    "no runtime",
                    "{} ignores scope cancellation",
                    self.inner.options.name
                );
            }
        }
    }

    /// Subscribe to every value published from now on.
    pub fn subscribe(&self) -> (Receiver<T>, Unsubscribe<T>) {
        self.register(None)
    }

    /// Subscribe to values for which `predicate` returns true at publish time.
    pub fn subscribe_filtered(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> (Receiver<T>, Unsubscribe<T>) {
        self.register(Some(Arc::new(predicate)))
    }

    fn register(&self, filter: Option<Predicate<T>>) -> (Receiver<T>, Unsubscribe<T>) {
        let capacity = self.inner.options.subscriber_buffer_size.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);

        let mut state = self.inner.state.lock();
        if state.closed {
            // Sender dropped here: the receiver reads as an empty, closed stream.
            return (rx, Unsubscribe::detached());
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, Subscriber { tx, filter });

        (
            rx,
            Unsubscribe {
                id,
                bus: Arc::downgrade(&self.inner),
            },
        )
    }

    /// Deliver `value` to every matching subscriber without holding the lock.
    pub fn publish(&self, value: T) -> PublishOutcome {
        let targets: Vec<(u64, Sender<T>, Option<Predicate<T>>)> = {
            let state = self.inner.state.lock();
            if state.closed {
                return PublishOutcome::default();
            }
            state
                .subscribers
                .iter()
                .map(|(id, sub)| (*id, sub.tx.clone(), sub.filter.clone()))
                .collect()
        };

        let options = &self.inner.options;
        let mut outcome = PublishOutcome::default();
        let mut disconnected = Vec::new();

        for (id, tx, filter) in targets {
            if let Some(filter) = &filter {
                if !filter(&value) {
                    continue;
                }
            }

            let result = if options.block_on_full {
                tx.send_timeout(value.clone(), options.write_timeout)
                    .map_err(|e| e.is_disconnected())
            } else {
                tx.try_send(value.clone())
                    .map_err(|e| matches!(e, TrySendError::Disconnected(_)))
            };

            match result {
                Ok(()) => outcome.delivered += 1,
                Err(true) => disconnected.push(id),
                Err(false) => outcome.dropped += 1,
            }
        }

        if !disconnected.is_empty() {
            let mut state = self.inner.state.lock();
            for id in disconnected {
                state.subscribers.remove(&id);
            }
        }

        outcome
    }

    /// Close every delivery channel. Later publishes are no-ops and later
    /// subscriptions receive an already-closed channel.
    pub fn close(&self) {
        let subscribers = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        self.inner.done.cancel();

        crate::debug_event!(
            "bus",
            "closed",
            "{} ({} subscribers)",
            self.inner.options.name,
            subscribers.len()
        );
        drop(subscribers);
    }
}

impl<T> Bus<T> {
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn options(&self) -> &BusOptions {
        &self.inner.options
    }
}

/// Cancels one bus subscription.
///
/// Cancelling closes the subscriber's channel and is idempotent. Dropping
/// an `Unsubscribe` without calling [`Unsubscribe::cancel`] leaves the
/// subscription active.
pub struct Unsubscribe<T> {
    id: u64,
    bus: Weak<BusInner<T>>,
}

impl<T> Unsubscribe<T> {
    fn detached() -> Self {
        Self {
            id: u64::MAX,
            bus: Weak::new(),
        }
    }

    pub fn cancel(&self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.state.lock().subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;

    fn options(buffer: usize) -> BusOptions {
        BusOptions {
            name: "test".to_string(),
            subscriber_buffer_size: buffer,
            ..BusOptions::default()
        }
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        let (rx1, _c1) = bus.subscribe();
        let (rx2, _c2) = bus.subscribe();

        let outcome = bus.publish(7);

        assert_eq!(outcome.delivered, 2);
        assert_eq!(rx1.try_recv().unwrap(), 7);
        assert_eq!(rx2.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_no_backfill_for_late_subscriber() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        bus.publish(1);

        let (rx, _cancel) = bus.subscribe();
        assert!(rx.try_recv().is_err());

        bus.publish(2);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_filtered_subscription() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        let (even, _c1) = bus.subscribe_filtered(|v| v % 2 == 0);
        let (all, _c2) = bus.subscribe();

        for v in 1..=4 {
            bus.publish(v);
        }

        assert_eq!(even.try_iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(all.try_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_full_buffer_drops_only_for_slow_subscriber() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(1));
        let (slow, _c1) = bus.subscribe();
        let (fast, _c2) = bus.subscribe();

        assert_eq!(bus.publish(1).delivered, 2);
        assert_eq!(fast.try_recv().unwrap(), 1);

        let outcome = bus.publish(2);
        assert_eq!(outcome, PublishOutcome { delivered: 1, dropped: 1 });

        assert_eq!(slow.try_iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(fast.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_blocking_mode_gives_up_after_timeout() {
        let bus: Bus<u32> = Bus::new(
            &CancellationToken::new(),
            BusOptions {
                name: "blocking".to_string(),
                subscriber_buffer_size: 1,
                block_on_full: true,
                write_timeout: Duration::from_millis(20),
            },
        );
        let (rx, _cancel) = bus.subscribe();

        bus.publish(1);
        let started = std::time::Instant::now();
        let outcome = bus.publish(2);

        assert_eq!(outcome.dropped, 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_blocking_mode_waits_for_consumer() {
        let bus: Bus<u32> = Bus::new(
            &CancellationToken::new(),
            BusOptions {
                name: "blocking".to_string(),
                subscriber_buffer_size: 1,
                block_on_full: true,
                write_timeout: Duration::from_secs(5),
            },
        );
        let (rx, _cancel) = bus.subscribe();

        let consumer = std::thread::spawn(move || rx.iter().take(3).collect::<Vec<_>>());
        for v in 0..3 {
            assert_eq!(bus.publish(v).delivered, 1);
        }

        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancel_stops_delivery_to_one_subscriber() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        let (rx1, cancel1) = bus.subscribe();
        let (rx2, _c2) = bus.subscribe();

        cancel1.cancel();
        cancel1.cancel();
        bus.publish(5);

        assert!(matches!(
            rx1.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
        assert_eq!(rx2.try_recv().unwrap(), 5);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_close_and_subscribe_after_close() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        let (rx, _cancel) = bus.subscribe();

        bus.close();
        bus.close();

        assert!(rx.recv().is_err());
        assert_eq!(bus.publish(1), PublishOutcome::default());

        let (late, cancel) = bus.subscribe();
        assert!(late.recv().is_err());
        cancel.cancel();
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus: Bus<u32> = Bus::new(&CancellationToken::new(), options(10));
        let (rx, _cancel) = bus.subscribe();
        drop(rx);

        let outcome = bus.publish(1);
        assert_eq!(outcome, PublishOutcome::default());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_cancellation_closes_bus() {
        let scope = CancellationToken::new();
        let bus: Bus<u32> = Bus::new(&scope, options(10));
        let (rx, _cancel) = bus.subscribe();

        scope.cancel();

        let closed = tokio::task::spawn_blocking(move || rx.recv().is_err())
            .await
            .unwrap();
        assert!(closed);
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_bus_releases_scope_task() {
        let metrics = tokio::runtime::Handle::current().metrics();
        let scope = CancellationToken::new();
        let before = metrics.num_alive_tasks();

        for _ in 0..50 {
            let bus: Bus<u32> = Bus::new(&scope, options(10));
            let (_rx, _cancel) = bus.subscribe();
        }
        let closed: Bus<u32> = Bus::new(&scope, options(10));
        closed.close();

        for _ in 0..100 {
            if metrics.num_alive_tasks() == before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(metrics.num_alive_tasks(), before);
        assert!(!scope.is_cancelled());
        drop(closed);
    }

    #[test]
    fn test_cancelled_scope_yields_closed_bus() {
        let scope = CancellationToken::new();
        scope.cancel();

        let bus: Bus<u32> = Bus::new(&scope, options(10));
        assert!(bus.is_closed());
    }
}
