//! In-memory watch primitive.
//!
//! Used by tests and dry runs. Registrations are tracked in a table instead
//! of the OS; events are injected with [`MemoryPrimitive::emit`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::error::WatchError;
use super::event::{Event, EventType, Op};
use super::primitive::{EventCallback, HandleResource, WatchHandle, WatchPrimitive};

/// Watch primitive that keeps registrations in memory.
#[derive(Clone, Default)]
pub struct MemoryPrimitive {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    registrations: HashMap<u64, (PathBuf, EventCallback)>,
    calls: HashMap<PathBuf, usize>,
    failing: HashSet<PathBuf>,
    require_existing: bool,
    latency: Option<Duration>,
}

impl MemoryPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject paths that do not exist on disk, like an OS backend would.
    pub fn requiring_existing_paths(self) -> Self {
        self.inner.state.lock().require_existing = true;
        self
    }

    /// Make every `watch` call block for `latency` before registering.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.state.lock().latency = Some(latency);
        self
    }

    /// Fail future registrations of `path`.
    pub fn fail_path(&self, path: impl Into<PathBuf>) {
        self.inner.state.lock().failing.insert(path.into());
    }

    pub fn clear_failure(&self, path: &Path) {
        self.inner.state.lock().failing.remove(path);
    }

    /// Number of `watch` calls made for `path`, successful or not.
    pub fn watch_calls(&self, path: &Path) -> usize {
        self.inner.state.lock().calls.get(path).copied().unwrap_or(0)
    }

    /// Number of open registrations for `path`.
    pub fn active(&self, path: &Path) -> usize {
        self.inner
            .state
            .lock()
            .registrations
            .values()
            .filter(|(p, _)| p == path)
            .count()
    }

    /// Number of open registrations across all paths.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().registrations.len()
    }

    /// Deliver a change to every registration on `path` or on its parent
    /// directory. Returns the number of callbacks invoked.
    pub fn emit(&self, path: impl AsRef<Path>, op: Op) -> usize {
        self.deliver(Event::new(EventType::FileChanged, path.as_ref(), op))
    }

    /// Deliver a backend error for `path`.
    pub fn emit_error(&self, path: impl AsRef<Path>) -> usize {
        self.deliver(Event::new(EventType::WatchError, path.as_ref(), Op::empty()))
    }

    fn deliver(&self, event: Event) -> usize {
        let parent = event.path.parent().map(Path::to_path_buf);
        let targets: Vec<EventCallback> = {
            let state = self.inner.state.lock();
            state
                .registrations
                .values()
                .filter(|(p, _)| *p == event.path || Some(p) == parent.as_ref())
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        for callback in &targets {
            callback(event.clone());
        }
        targets.len()
    }
}

impl WatchPrimitive for MemoryPrimitive {
    fn watch(&self, path: &Path, on_event: EventCallback) -> Result<WatchHandle, WatchError> {
        let (latency, require_existing) = {
            let mut state = self.inner.state.lock();
            *state.calls.entry(path.to_path_buf()).or_default() += 1;
            (state.latency, state.require_existing)
        };

        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        if require_existing && !path.exists() {
            return Err(WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: "No such file or directory".to_string(),
            });
        }

        let mut state = self.inner.state.lock();
        if state.failing.contains(path) {
            return Err(WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: "injected failure".to_string(),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state
            .registrations
            .insert(id, (path.to_path_buf(), on_event));

        Ok(WatchHandle::new(
            path,
            MemoryRegistration {
                id,
                owner: Arc::downgrade(&self.inner),
            },
        ))
    }
}

struct MemoryRegistration {
    id: u64,
    owner: Weak<MemoryInner>,
}

impl HandleResource for MemoryRegistration {
    fn release(self: Box<Self>) -> Result<(), WatchError> {
        if let Some(owner) = self.owner.upgrade() {
            owner.state.lock().registrations.remove(&self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_file_and_parent_watches() {
        let memory = MemoryPrimitive::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let _dir = memory
            .watch(
                Path::new("/project/src"),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let counter = hits.clone();
        let _file = memory
            .watch(
                Path::new("/project/src/main.rs"),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(memory.emit("/project/src/main.rs", Op::WRITE), 2);
        assert_eq!(memory.emit("/project/other.rs", Op::WRITE), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_releases_registration() {
        let memory = MemoryPrimitive::new();
        let handle = memory.watch(Path::new("/a"), Arc::new(|_| {})).unwrap();
        assert_eq!(memory.active(Path::new("/a")), 1);

        handle.close().unwrap();
        assert_eq!(memory.active(Path::new("/a")), 0);
        assert_eq!(memory.watch_calls(Path::new("/a")), 1);
    }

    #[test]
    fn test_injected_failure() {
        let memory = MemoryPrimitive::new();
        memory.fail_path("/bad");

        assert!(memory.watch(Path::new("/bad"), Arc::new(|_| {})).is_err());
        assert_eq!(memory.active_count(), 0);

        memory.clear_failure(Path::new("/bad"));
        assert!(memory.watch(Path::new("/bad"), Arc::new(|_| {})).is_ok());
    }
}
