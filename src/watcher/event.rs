//! Typed events published by the registrar and the hub.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use notify::EventKind;
use notify::event::ModifyKind;

/// Domain category of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A watched file or directory changed on disk.
    FileChanged,
    /// The checked-out VCS branch changed.
    BranchChanged,
    /// A watch failed or the backend reported an error for a path.
    WatchError,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::FileChanged => "file_changed",
            EventType::BranchChanged => "branch_changed",
            EventType::WatchError => "watch_error",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Filesystem operations carried by an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Op: u8 {
        const CREATE = 1 << 0;
        const WRITE = 1 << 1;
        const REMOVE = 1 << 2;
        const RENAME = 1 << 3;
        const CHMOD = 1 << 4;
    }
}

impl Op {
    /// Operations that destroy or replace the inode behind a path.
    pub const REPLACED: Op = Op::REMOVE.union(Op::RENAME);

    /// Map a notify event kind onto our operation set.
    ///
    /// Access and unclassified events map to the empty set and are not forwarded.
    pub fn from_kind(kind: &EventKind) -> Op {
        match kind {
            EventKind::Create(_) => Op::CREATE,
            EventKind::Modify(ModifyKind::Name(_)) => Op::RENAME,
            EventKind::Modify(ModifyKind::Metadata(_)) => Op::CHMOD,
            EventKind::Modify(_) => Op::WRITE,
            EventKind::Remove(_) => Op::REMOVE,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Op::empty(),
        }
    }
}

/// An immutable filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub ty: EventType,
    pub path: PathBuf,
    pub op: Op,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(ty: EventType, path: impl Into<PathBuf>, op: Op) -> Self {
        Self {
            ty,
            path: path.into(),
            op,
            timestamp: Utc::now(),
        }
    }

    /// Re-type an event, keeping its path, operations and timestamp.
    pub fn with_type(self, ty: EventType) -> Self {
        Self { ty, ..self }
    }

    pub fn is_for(&self, path: &Path) -> bool {
        self.path == path
    }

    /// True if the underlying file was deleted or replaced.
    pub fn is_replacement(&self) -> bool {
        self.op.intersects(Op::REPLACED)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.ty,
            self.op,
            self.path.display()
        )
    }
}
