//! The watch primitive seam and its notify-backed implementation.
//!
//! A primitive registers exactly one path and hands back a [`WatchHandle`].
//! Raw notifications are delivered through the registration callback on
//! whatever thread the backend dispatches from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::error::WatchError;
use super::event::{Event, EventType, Op};

/// Callback invoked for every raw notification of one registration.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Backend resource released when a [`WatchHandle`] closes.
pub trait HandleResource: Send {
    fn release(self: Box<Self>) -> Result<(), WatchError>;
}

/// Ownership token for a single registration with a [`WatchPrimitive`].
///
/// Closing is idempotent: only the first call releases the resource, later
/// calls return `Ok(())`. Dropping an open handle closes it.
pub struct WatchHandle {
    path: PathBuf,
    resource: Mutex<Option<Box<dyn HandleResource>>>,
}

impl WatchHandle {
    pub fn new(path: impl Into<PathBuf>, resource: impl HandleResource + 'static) -> Self {
        Self {
            path: path.into(),
            resource: Mutex::new(Some(Box::new(resource))),
        }
    }

    /// The path this handle was registered for.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.resource.lock().is_none()
    }

    /// Release the underlying registration.
    pub fn close(&self) -> Result<(), WatchError> {
        let resource = self.resource.lock().take();
        match resource {
            Some(resource) => resource.release(),
            None => Ok(()),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            crate::debug_event!("watcher", "close on drop failed", "{e}");
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A backend able to watch a single path.
pub trait WatchPrimitive: Send + Sync {
    /// Register `path` and deliver its notifications to `on_event`.
    fn watch(&self, path: &Path, on_event: EventCallback) -> Result<WatchHandle, WatchError>;
}

/// Watch primitive backed by `notify::RecommendedWatcher`.
///
/// Each registration owns its own OS watcher instance, so notifications of
/// one path are dispatched in order on that instance's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyPrimitive;

impl NotifyPrimitive {
    pub fn new() -> Self {
        Self
    }
}

impl WatchPrimitive for NotifyPrimitive {
    fn watch(&self, path: &Path, on_event: EventCallback) -> Result<WatchHandle, WatchError> {
        let watched = path.to_path_buf();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let op = Op::from_kind(&event.kind);
                    if op.is_empty() {
                        return;
                    }
                    for path in event.paths {
                        on_event(Event::new(EventType::FileChanged, path, op));
                    }
                }
                Err(e) => {
                    let path = e.paths.first().cloned().unwrap_or_else(|| watched.clone());
                    tracing::warn!("[watcher] backend error for {}: {e}", path.display());
                    on_event(Event::new(EventType::WatchError, path, Op::empty()));
                }
            })
            .map_err(|e| WatchError::InitFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(WatchHandle::new(
            path,
            NotifyResource {
                path: path.to_path_buf(),
                watcher,
            },
        ))
    }
}

struct NotifyResource {
    path: PathBuf,
    watcher: notify::RecommendedWatcher,
}

impl HandleResource for NotifyResource {
    fn release(mut self: Box<Self>) -> Result<(), WatchError> {
        match self.watcher.unwatch(&self.path) {
            Ok(()) => Ok(()),
            // The backend drops the watch itself once the inode is gone.
            Err(e) if matches!(e.kind, notify::ErrorKind::WatchNotFound) => Ok(()),
            Err(e) => Err(WatchError::PathWatchFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
