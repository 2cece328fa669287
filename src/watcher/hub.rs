//! Caller-facing event hub.
//!
//! Wraps a [`Bus`] of [`Event`]s and a table of single-file watches. Raw
//! notifications of each watched file are re-published as `FileChanged`
//! events; collaborators subscribe by [`EventType`].
//!
//! The file table is deliberately not reference-counted: a path has at most
//! one owner, and watching an already-watched path is a successful no-op.
//! Use [`RecursiveRegistrar`](super::RecursiveRegistrar) when several owners
//! need independent lifetimes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusOptions, Unsubscribe};

use super::error::WatchError;
use super::event::{Event, EventType};
use super::primitive::{EventCallback, WatchHandle, WatchPrimitive};

/// Identifies a subscription made through [`EventHub::subscribe`].
pub type SubscriptionId = u64;

struct HubInner {
    bus: Option<Bus<Event>>,
    primitive: Option<Arc<dyn WatchPrimitive>>,
    scope: CancellationToken,
    /// `None` marks a registration still in flight.
    watches: Mutex<HashMap<PathBuf, Option<WatchHandle>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Unsubscribe<Event>>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    /// Cancelled on close or drop; ends the scope watcher task.
    done: CancellationToken,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Typed event façade over the bus and the watch primitive.
///
/// Cheap to clone; clones share state. A hub built with
/// [`EventHub::disabled`] accepts every call as a successful no-op.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Create a hub whose lifetime is bounded by `parent`.
    ///
    /// Cancelling `parent` closes the hub (observed on the current tokio
    /// runtime, if any).
    pub fn new(
        parent: &CancellationToken,
        primitive: Arc<dyn WatchPrimitive>,
        options: BusOptions,
    ) -> Self {
        let scope = parent.child_token();
        let bus = Bus::new(&scope, options);
        let hub = Self::build(Some(bus), Some(primitive), scope);
        hub.close_on_cancel();
        hub
    }

    /// A hub with no bus and no primitive.
    pub fn disabled() -> Self {
        Self::build(None, None, CancellationToken::new())
    }

    fn build(
        bus: Option<Bus<Event>>,
        primitive: Option<Arc<dyn WatchPrimitive>>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                bus,
                primitive,
                scope,
                watches: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                done: CancellationToken::new(),
            }),
        }
    }

    fn close_on_cancel(&self) {
        let scope = self.inner.scope.clone();
        if scope.is_cancelled() {
            self.close();
            return;
        }

        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        let done = self.inner.done.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::select! {
                    _ = scope.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            EventHub { inner }.close();
                        }
                    }
                    _ = done.cancelled() => {}
                }
            });
        }
    }

    /// Invoke `listener` for every event of type `ty`.
    ///
    /// Each subscription is served by its own delivery thread, so a slow
    /// listener stalls only its own channel.
    pub fn subscribe(
        &self,
        ty: EventType,
        listener: impl Fn(Event) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let Some(bus) = &self.inner.bus else {
            return id;
        };

        let (rx, cancel) = bus.subscribe_filtered(move |event: &Event| event.ty == ty);
        self.track(id, cancel);

        let spawned = std::thread::Builder::new()
            .name(format!("watchhub-sub-{id}"))
            .spawn(move || {
                for event in rx.iter() {
                    listener(event);
                }
                crate::debug_event!("hub", "subscription ended", "{id} ({ty})");
            });

        if let Err(e) = spawned {
            tracing::warn!("[hub] failed to start delivery for {ty} subscription: {e}");
            self.unsubscribe(id);
        }
        id
    }

    /// Receive every event on a channel instead of a listener.
    ///
    /// On a disabled or closed hub the channel is already closed.
    pub fn subscribe_all(&self) -> (SubscriptionId, Receiver<Event>) {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        match &self.inner.bus {
            Some(bus) => {
                let (rx, cancel) = bus.subscribe();
                self.track(id, cancel);
                (id, rx)
            }
            None => {
                let (_, rx) = crossbeam_channel::bounded(1);
                (id, rx)
            }
        }
    }

    fn track(&self, id: SubscriptionId, cancel: Unsubscribe<Event>) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if self.is_closed() {
            cancel.cancel();
            return;
        }
        subscriptions.insert(id, cancel);
    }

    /// Cancel a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let cancel = self.inner.subscriptions.lock().remove(&id);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Publish an event to subscribers.
    pub fn publish(&self, event: Event) {
        if self.is_closed() {
            return;
        }
        if let Some(bus) = &self.inner.bus {
            deliver(bus, event);
        }
    }

    /// Watch a single file and publish its changes as `FileChanged` events.
    ///
    /// Returns immediately if the path is already in the table, including
    /// when another caller's registration is still in flight. Fails with
    /// [`WatchError::Superseded`] if the path was unwatched (or the hub
    /// closed) while this call's registration was in flight.
    pub fn watch_file(&self, path: &Path) -> Result<(), WatchError> {
        let (Some(primitive), Some(bus)) = (&self.inner.primitive, &self.inner.bus) else {
            return Ok(());
        };

        {
            let mut watches = self.inner.watches.lock();
            if self.is_closed() || watches.contains_key(path) {
                return Ok(());
            }
            watches.insert(path.to_path_buf(), None);
        }

        let bus = bus.clone();
        let on_event: EventCallback = Arc::new(move |raw: Event| {
            let ty = match raw.ty {
                EventType::WatchError => EventType::WatchError,
                EventType::FileChanged | EventType::BranchChanged => EventType::FileChanged,
            };
            deliver(&bus, raw.with_type(ty));
        });

        match primitive.watch(path, on_event) {
            Ok(handle) => {
                let mut watches = self.inner.watches.lock();
                match watches.get_mut(path) {
                    Some(slot) if slot.is_none() => {
                        *slot = Some(handle);
                        return Ok(());
                    }
                    _ => {}
                }
                // Unwatched or closed while the registration was in flight.
                drop(watches);
                if let Err(e) = handle.close() {
                    tracing::warn!("[hub] failed to close {}: {e}", path.display());
                }
                Err(WatchError::Superseded {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                let mut watches = self.inner.watches.lock();
                if matches!(watches.get(path), Some(None)) {
                    watches.remove(path);
                }
                Err(e)
            }
        }
    }

    /// Stop watching `path`. No-op if it is not watched.
    pub fn unwatch_file(&self, path: &Path) {
        let entry = self.inner.watches.lock().remove(path);
        if let Some(Some(handle)) = entry {
            if let Err(e) = handle.close() {
                tracing::warn!("[hub] failed to close {}: {e}", path.display());
            }
            crate::debug_event!("hub", "unwatched", "{}", path.display());
        }
    }

    /// True once a registration for `path` has completed.
    pub fn is_watching(&self, path: &Path) -> bool {
        matches!(self.inner.watches.lock().get(path), Some(Some(_)))
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner
            .watches
            .lock()
            .iter()
            .filter(|(_, handle)| handle.is_some())
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.bus.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The hub's lifetime scope; cancelled when the hub closes.
    pub fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    /// Tear the hub down. Only the first call does any work.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.scope.cancel();
        self.inner.done.cancel();
        if let Some(bus) = &self.inner.bus {
            bus.close();
        }

        let watches = std::mem::take(&mut *self.inner.watches.lock());
        let count = watches.len();
        for (path, handle) in watches {
            if let Some(handle) = handle {
                if let Err(e) = handle.close() {
                    tracing::warn!("[hub] failed to close {}: {e}", path.display());
                }
            }
        }

        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        for cancel in subscriptions.values() {
            cancel.cancel();
        }

        crate::debug_event!(
            "hub",
            "closed",
            "{count} watches, {} subscriptions",
            subscriptions.len()
        );
    }
}

fn deliver(bus: &Bus<Event>, event: Event) {
    let path = event.path.clone();
    let ty = event.ty;
    let outcome = bus.publish(event);
    if outcome.dropped == 0 {
        return;
    }

    if bus.options().block_on_full {
        tracing::warn!(
            "[hub] slow consumer: dropped {ty} for {} at {} subscribers",
            path.display(),
            outcome.dropped
        );
    } else {
        crate::debug_event!(
            "hub",
            "dropped",
            "{ty} for {} at {} full subscribers",
            path.display(),
            outcome.dropped
        );
    }
}
