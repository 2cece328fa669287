//! Reference-counted directory watch registration with an admission cap.
//!
//! Every path maps to at most one OS registration. Recursive owners share
//! it through a refcount; a direct-file watch on the same path holds it too.
//! The registration is released only when neither holds it anymore.
//!
//! Registration is two-phase: the slot is reserved under the lock, the
//! (possibly slow) primitive call runs outside it, and a failure rolls the
//! reservation back. Concurrent callers therefore never share one unit of
//! capacity, and the active count never overshoots the cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::bus::{Bus, Unsubscribe};
use crate::config::WatcherConfig;

use super::error::WatchError;
use super::event::Event;
use super::primitive::{EventCallback, WatchHandle, WatchPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Recursive,
    Direct,
}

struct WatchEntry {
    refcount: usize,
    direct: bool,
    /// `None` while the primitive call is in flight.
    handle: Option<WatchHandle>,
}

impl WatchEntry {
    fn reserved(owner: Owner) -> Self {
        Self {
            refcount: usize::from(owner == Owner::Recursive),
            direct: owner == Owner::Direct,
            handle: None,
        }
    }

    fn claim(&mut self, owner: Owner) {
        match owner {
            Owner::Recursive => self.refcount += 1,
            Owner::Direct => self.direct = true,
        }
    }

    /// Drop one claim of `owner`. Returns false if `owner` held none.
    fn release(&mut self, owner: Owner) -> bool {
        match owner {
            Owner::Recursive if self.refcount > 0 => {
                self.refcount -= 1;
                true
            }
            Owner::Direct if self.direct => {
                self.direct = false;
                true
            }
            _ => false,
        }
    }

    fn is_unowned(&self) -> bool {
        self.refcount == 0 && !self.direct
    }
}

#[derive(Default)]
struct RegistrarState {
    closed: bool,
    entries: HashMap<PathBuf, WatchEntry>,
}

/// Registers directory trees with the watch primitive.
///
/// Raw notifications of every registration are published on the
/// registrar's own bus; see [`RecursiveRegistrar::subscribe`].
pub struct RecursiveRegistrar {
    primitive: Arc<dyn WatchPrimitive>,
    bus: Bus<Event>,
    max_watches: usize,
    recursive: bool,
    state: Mutex<RegistrarState>,
}

impl RecursiveRegistrar {
    pub fn new(primitive: Arc<dyn WatchPrimitive>, bus: Bus<Event>, config: &WatcherConfig) -> Self {
        Self {
            primitive,
            bus,
            max_watches: config.max_watches,
            recursive: config.recursive,
            state: Mutex::new(RegistrarState::default()),
        }
    }

    /// Watch every directory below `root` (excluding `root` itself).
    ///
    /// All-or-nothing: if one directory fails, the directories added by
    /// this call are released again and a
    /// [`WatchError::PartialRegistration`] is returned. Unreadable
    /// subtrees are skipped.
    pub fn add_recursive_watches(&self, root: &Path) -> Result<Vec<PathBuf>, WatchError> {
        if !self.recursive {
            crate::debug_event!("registrar", "recursive watching disabled", "{}", root.display());
            return Ok(Vec::new());
        }

        let dirs = list_directories(root);
        let mut added = Vec::with_capacity(dirs.len());

        for dir in dirs {
            if let Err(e) = self.add_recursive_watch(&dir) {
                let rolled_back = added.len();
                self.remove_recursive_watches(&added);
                tracing::warn!(
                    "[registrar] recursive watch of {} failed at {}: {e}",
                    root.display(),
                    dir.display()
                );
                return Err(WatchError::PartialRegistration {
                    root: root.to_path_buf(),
                    failed: dir,
                    rolled_back,
                    source: Box::new(e),
                });
            }
            added.push(dir);
        }

        crate::debug_event!(
            "registrar",
            "tree registered",
            "{} ({} directories)",
            root.display(),
            added.len()
        );
        Ok(added)
    }

    /// Take one reference on `path`, registering it if it is new.
    pub fn add_recursive_watch(&self, path: &Path) -> Result<(), WatchError> {
        self.acquire(path, Owner::Recursive)
    }

    pub fn remove_recursive_watches(&self, paths: &[PathBuf]) {
        for path in paths {
            self.remove_recursive_watch(path);
        }
    }

    /// Drop one reference on `path`.
    pub fn remove_recursive_watch(&self, path: &Path) {
        self.release(path, Owner::Recursive);
    }

    /// Watch a single file (or directory) directly, sharing an existing
    /// registration on the same path.
    pub fn add_file_watch(&self, path: &Path) -> Result<(), WatchError> {
        self.acquire(path, Owner::Direct)
    }

    pub fn remove_file_watch(&self, path: &Path) {
        self.release(path, Owner::Direct);
    }

    fn acquire(&self, path: &Path, owner: Owner) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(entry) = state.entries.get_mut(path) {
                entry.claim(owner);
                return Ok(());
            }
            if state.entries.len() >= self.max_watches {
                return Err(WatchError::MaxWatchesExceeded {
                    max: self.max_watches,
                });
            }
            state
                .entries
                .insert(path.to_path_buf(), WatchEntry::reserved(owner));
        }

        match self.primitive.watch(path, self.callback()) {
            Ok(handle) => {
                let mut state = self.state.lock();
                let active = state.entries.len();
                if let Some(entry) = state.entries.get_mut(path) {
                    entry.handle = Some(handle);
                    drop(state);
                    crate::debug_event!(
                        "registrar",
                        "watching",
                        "{} ({active}/{} active)",
                        path.display(),
                        self.max_watches
                    );
                    return Ok(());
                }
                // Released or closed while the registration was in flight.
                drop(state);
                if let Err(e) = handle.close() {
                    tracing::warn!("[registrar] failed to close {}: {e}", path.display());
                }
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if let Some(entry) = state.entries.get_mut(path) {
                    entry.release(owner);
                    if entry.is_unowned() {
                        state.entries.remove(path);
                    }
                }
                Err(e)
            }
        }
    }

    fn release(&self, path: &Path, owner: Owner) {
        let handle = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(path) else {
                return;
            };
            if !entry.release(owner) || !entry.is_unowned() {
                return;
            }
            state.entries.remove(path).and_then(|entry| entry.handle)
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.close() {
                tracing::warn!("[registrar] failed to close {}: {e}", path.display());
            }
        }
        crate::debug_event!(
            "registrar",
            "released",
            "{} ({} active)",
            path.display(),
            self.active_watches()
        );
    }

    fn callback(&self) -> EventCallback {
        let bus = self.bus.clone();
        Arc::new(move |event: Event| {
            bus.publish(event);
        })
    }

    /// Receive raw notifications from every registration.
    pub fn subscribe(&self) -> (Receiver<Event>, Unsubscribe<Event>) {
        self.bus.subscribe()
    }

    /// Number of OS registrations, including ones still in flight.
    pub fn active_watches(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn max_watches(&self) -> usize {
        self.max_watches
    }

    /// Recursive references held on `path`.
    pub fn refcount(&self, path: &Path) -> usize {
        self.state
            .lock()
            .entries
            .get(path)
            .map_or(0, |entry| entry.refcount)
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Release every registration and close the bus. Later registrations
    /// succeed as no-ops.
    pub fn close(&self) {
        let entries = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.entries)
        };

        let count = entries.len();
        for (path, entry) in entries {
            if let Some(handle) = entry.handle {
                if let Err(e) = handle.close() {
                    tracing::warn!("[registrar] failed to close {}: {e}", path.display());
                }
            }
        }
        self.bus.close();
        crate::debug_event!("registrar", "closed", "{count} watches released");
    }
}

/// Best-effort walk: unreadable directories are skipped with their subtree.
fn list_directories(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                crate::debug_event!("registrar", "skipped", "{e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}
