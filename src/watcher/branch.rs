//! VCS branch pointer watcher.
//!
//! Git rewrites `.git/HEAD` by renaming a lock file over it, which replaces
//! the inode a file watch is attached to. The HEAD watch is therefore kept
//! alive by a [`WatchSupervisor`], and every change to HEAD is compared with
//! the last seen branch to publish `BranchChanged`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::backoff::BackoffPolicy;
use super::error::WatchError;
use super::event::{Event, EventType};
use super::hub::{EventHub, SubscriptionId};
use super::supervisor::WatchSupervisor;

struct BranchInner {
    hub: EventHub,
    head: PathBuf,
    current: Mutex<Option<String>>,
}

impl BranchInner {
    fn on_head_event(&self, event: &Event) {
        if !event.is_for(&self.head) {
            return;
        }

        let branch = read_branch(&self.head);
        let previous = {
            let mut current = self.current.lock();
            if *current == branch {
                return;
            }
            std::mem::replace(&mut *current, branch.clone())
        };

        crate::log_event!(
            "branch",
            "changed",
            "{} -> {}",
            previous.as_deref().unwrap_or("(detached)"),
            branch.as_deref().unwrap_or("(detached)")
        );
        self.hub
            .publish(Event::new(EventType::BranchChanged, &self.head, event.op));
    }
}

/// Publishes `BranchChanged` when the checked-out branch of a repository changes.
pub struct BranchWatcher {
    inner: Arc<BranchInner>,
    subscription: SubscriptionId,
    supervisor: WatchSupervisor,
}

impl BranchWatcher {
    /// Start watching the HEAD of the repository at `repo_root`.
    ///
    /// A missing HEAD is not an error; the supervisor keeps retrying until
    /// it appears.
    pub fn start(
        hub: EventHub,
        repo_root: &Path,
        backoff: BackoffPolicy,
    ) -> Result<Self, WatchError> {
        let head = repo_root.join(".git").join("HEAD");
        let inner = Arc::new(BranchInner {
            hub: hub.clone(),
            current: Mutex::new(read_branch(&head)),
            head: head.clone(),
        });

        let listener = Arc::clone(&inner);
        let subscription = hub.subscribe(EventType::FileChanged, move |event| {
            listener.on_head_event(&event);
        });

        let supervisor = match WatchSupervisor::new(hub.clone(), &head, backoff) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                hub.unsubscribe(subscription);
                return Err(e);
            }
        };
        supervisor.start();

        crate::debug_event!(
            "branch",
            "watching",
            "{} on {}",
            head.display(),
            inner.current.lock().as_deref().unwrap_or("(detached)")
        );

        Ok(Self {
            inner,
            subscription,
            supervisor,
        })
    }

    /// Last observed branch name; `None` when HEAD is detached or unreadable.
    pub fn current_branch(&self) -> Option<String> {
        self.inner.current.lock().clone()
    }

    pub fn head_path(&self) -> &Path {
        &self.inner.head
    }

    pub fn supervisor(&self) -> &WatchSupervisor {
        &self.supervisor
    }

    pub fn shutdown(&self) {
        self.inner.hub.unsubscribe(self.subscription);
        self.supervisor.shutdown();
    }
}

impl Drop for BranchWatcher {
    fn drop(&mut self) {
        self.inner.hub.unsubscribe(self.subscription);
    }
}

/// Read the branch name HEAD points at.
///
/// Returns `None` for a detached HEAD (a bare commit id) or when the file
/// cannot be read.
pub fn read_branch(head: &Path) -> Option<String> {
    let content = fs::read_to_string(head).ok()?;
    let reference = content.trim().strip_prefix("ref:")?.trim();
    let branch = reference.strip_prefix("refs/heads/").unwrap_or(reference);
    (!branch.is_empty()).then(|| branch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusOptions;
    use crate::watcher::{MemoryPrimitive, Op};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn repo(branch: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(
            dir.path().join(".git/HEAD"),
            format!("ref: refs/heads/{branch}\n"),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_read_branch() {
        let dir = repo("main");
        let head = dir.path().join(".git/HEAD");
        assert_eq!(read_branch(&head).as_deref(), Some("main"));

        fs::write(&head, "ref: refs/heads/feature/watch-hub\n").unwrap();
        assert_eq!(read_branch(&head).as_deref(), Some("feature/watch-hub"));

        fs::write(&head, "3f2a9c1d0b7e6f5a4c3b2a1f0e9d8c7b6a5f4e3d\n").unwrap();
        assert_eq!(read_branch(&head), None);

        assert_eq!(read_branch(&dir.path().join("missing")), None);
    }

    #[tokio::test]
    async fn test_checkout_publishes_branch_changed() {
        let dir = repo("main");
        let head = dir.path().join(".git/HEAD");

        let memory = MemoryPrimitive::new().requiring_existing_paths();
        let hub = EventHub::new(
            &CancellationToken::new(),
            Arc::new(memory.clone()),
            BusOptions::named("branch-test"),
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        hub.subscribe(EventType::BranchChanged, move |event| {
            let _ = tx.send(event);
        });

        let watcher =
            BranchWatcher::start(hub.clone(), dir.path(), BackoffPolicy::default()).unwrap();
        assert_eq!(watcher.current_branch().as_deref(), Some("main"));
        assert!(hub.is_watching(&head));

        // Same branch rewritten: no event.
        memory.emit(&head, Op::WRITE);

        fs::write(&head, "ref: refs/heads/develop\n").unwrap();
        memory.emit(&head, Op::RENAME);

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.ty, EventType::BranchChanged);
        assert_eq!(event.path, head);
        assert_eq!(watcher.current_branch().as_deref(), Some("develop"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        // The rename also made the supervisor re-register HEAD.
        for _ in 0..100 {
            if memory.watch_calls(&head) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(memory.watch_calls(&head), 2);
        assert!(hub.is_watching(&head));

        watcher.shutdown();
        assert!(!hub.is_watching(&head));
    }
}
