//! Resource-bounded filesystem change notification.
//!
//! - [`bus`]: generic typed fan-out publish/subscribe.
//! - [`watcher::RecursiveRegistrar`]: reference-counted directory watches under an admission cap.
//! - [`watcher::EventHub`]: typed domain events and a deduplicated single-file watch table.
//! - [`watcher::WatchSupervisor`]: keeps a liveness-critical file watched across replacement.

pub mod bus;
pub mod config;
pub mod logging;
pub mod watcher;

pub use bus::{Bus, BusOptions, PublishOutcome, Unsubscribe};
pub use config::Settings;
pub use watcher::{
    BackoffPolicy, BranchWatcher, Event, EventHub, EventType, MemoryPrimitive, NotifyPrimitive,
    Op, RecursiveRegistrar, SupervisorState, WatchError, WatchHandle, WatchPrimitive,
    WatchSupervisor,
};
