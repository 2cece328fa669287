//! Filesystem watch subsystem.
//!
//! # Architecture
//!
//! ```text
//!                 WatchPrimitive (notify / memory)
//!                   |                      |
//!        RecursiveRegistrar            EventHub ------> subscribers
//!        (refcounted dirs,             (typed events,     (per-type
//!         admission cap)                file table)        delivery threads)
//!                   |                      ^
//!               Bus<Event>                 |
//!                                   WatchSupervisor / BranchWatcher
//! ```

mod backoff;
mod branch;
mod error;
mod event;
mod hub;
mod memory;
mod primitive;
mod registrar;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use branch::{BranchWatcher, read_branch};
pub use error::WatchError;
pub use event::{Event, EventType, Op};
pub use hub::{EventHub, SubscriptionId};
pub use memory::MemoryPrimitive;
pub use primitive::{EventCallback, HandleResource, NotifyPrimitive, WatchHandle, WatchPrimitive};
pub use registrar::RecursiveRegistrar;
pub use supervisor::{SupervisorState, WatchSupervisor};
