//! Self-healing single-file watch.
//!
//! Keeps one liveness-critical file (e.g. a plan document) watched across
//! atomic saves, deletes and checkouts:
//!
//! ```text
//! Unwatched --start ok--> Watching --remove/rename--> Unwatched --start--> ...
//!     |
//!     +--start failed--> Retrying --ok--> Watching
//! ```
//!
//! Retrying never gives up. At most one retry task runs per supervisor; a
//! retry requested while one is active is a no-op. Backoff sleeps end early
//! on shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::error::WatchError;
use super::event::{Event, EventType, Op};
use super::hub::{EventHub, SubscriptionId};

/// Lifecycle of a supervised watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unwatched,
    Watching,
    Retrying,
}

struct SupervisorInner {
    hub: EventHub,
    path: PathBuf,
    backoff: BackoffPolicy,
    runtime: Handle,
    shutdown: CancellationToken,
    state: Mutex<SupervisorState>,
    /// Single-flight guard for the retry task.
    retrying: Mutex<bool>,
    /// Bumped whenever the file is replaced; lets a retry task notice that
    /// its success was invalidated before it finished.
    generation: AtomicU64,
    retry_tasks: AtomicUsize,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Keeps `path` watched through the hub, re-watching after replacement.
pub struct WatchSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WatchSupervisor {
    /// Create a supervisor for `path`. Must be called inside a tokio runtime,
    /// which runs the retry task.
    pub fn new(
        hub: EventHub,
        path: impl Into<PathBuf>,
        backoff: BackoffPolicy,
    ) -> Result<Self, WatchError> {
        let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
        let shutdown = hub.scope().child_token();

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                hub,
                path: path.into(),
                backoff,
                runtime,
                shutdown,
                state: Mutex::new(SupervisorState::Unwatched),
                retrying: Mutex::new(false),
                generation: AtomicU64::new(0),
                retry_tasks: AtomicUsize::new(0),
                subscription: Mutex::new(None),
            }),
        })
    }

    /// Watch the file now, falling back to background retries on failure.
    pub fn start(&self) {
        self.inner.ensure_subscribed();
        self.inner.attempt();
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.lock()
    }

    pub fn is_retrying(&self) -> bool {
        *self.inner.retrying.lock()
    }

    /// Number of retry tasks spawned over the supervisor's lifetime.
    pub fn retry_tasks_spawned(&self) -> usize {
        self.inner.retry_tasks.load(Ordering::Relaxed)
    }

    /// Stop supervising and unwatch the file. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.hub.unsubscribe(id);
        }
        self.inner.hub.unwatch_file(&self.inner.path);
        *self.inner.state.lock() = SupervisorState::Unwatched;
        crate::debug_event!("supervisor", "stopped", "{}", self.inner.path.display());
    }
}

impl Drop for WatchSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SupervisorInner {
    fn ensure_subscribed(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let id = self.hub.subscribe(EventType::FileChanged, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_file_event(&event);
            }
        });
        *subscription = Some(id);
    }

    fn on_file_event(self: &Arc<Self>, event: &Event) {
        if !event.is_for(&self.path) || !event.is_replacement() {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        crate::log_event!(
            "supervisor",
            "file replaced",
            "{} ({:?}), re-watching",
            self.path.display(),
            event.op
        );
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.hub.unwatch_file(&self.path);
        *self.state.lock() = SupervisorState::Unwatched;
        self.attempt();
    }

    fn attempt(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        match self.hub.watch_file(&self.path) {
            Ok(()) => {
                if self.mark_watching() {
                    crate::log_event!("supervisor", "watching", "{}", self.path.display());
                }
            }
            Err(_) if self.shutdown.is_cancelled() => {}
            Err(e) => {
                tracing::warn!(
                    "[supervisor] cannot watch {}: {e}; retrying in background",
                    self.path.display()
                );
                self.hub
                    .publish(Event::new(EventType::WatchError, &self.path, Op::empty()));
                self.spawn_retry();
            }
        }
    }

    /// Enter `Watching` unless shutdown has begun. The state lock orders
    /// this against `shutdown`, which sets `Unwatched` after cancelling.
    fn mark_watching(&self) -> bool {
        let mut state = self.state.lock();
        if self.shutdown.is_cancelled() {
            return false;
        }
        *state = SupervisorState::Watching;
        true
    }

    fn spawn_retry(self: &Arc<Self>) {
        let mut retrying = self.retrying.lock();
        if *retrying {
            crate::debug_event!("supervisor", "retry already active", "{}", self.path.display());
            return;
        }
        *retrying = true;
        *self.state.lock() = SupervisorState::Retrying;
        self.retry_tasks.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move { inner.retry_loop().await });
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let generation = self.generation.load(Ordering::Acquire);
            match self.hub.watch_file(&self.path) {
                Ok(()) => {
                    let mut retrying = self.retrying.lock();
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    if self.generation.load(Ordering::Acquire) != generation {
                        // Replaced again while we were registering; go round once more.
                        drop(retrying);
                        continue;
                    }
                    *retrying = false;
                    let watching = self.mark_watching();
                    drop(retrying);
                    if !watching {
                        break;
                    }

                    crate::log_event!(
                        "supervisor",
                        "watching",
                        "{} after {} retries",
                        self.path.display(),
                        attempt + 1
                    );
                    return;
                }
                Err(e) => {
                    let delay = self.backoff.next(attempt);
                    attempt = attempt.saturating_add(1);
                    crate::debug_event!(
                        "supervisor",
                        "retry failed",
                        "{}: {e}; next attempt in {delay:?}",
                        self.path.display()
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        *self.retrying.lock() = false;
        crate::debug_event!("supervisor", "retry cancelled", "{}", self.path.display());
    }
}
