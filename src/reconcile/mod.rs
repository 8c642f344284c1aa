//! Incremental reconciliation of change events into index writes.
//!
//! Raw events are merged per path, folder events are expanded against the
//! index, and every surviving event is resolved against the live backend.
//! [`SyncEngine`] drives one cycle per resource.

pub mod expand;
pub mod merge;
mod sync;

pub use self::{
    expand::{expand_events, indexed_paths},
    merge::{Merged, merge_events},
    sync::{RebuildStatus, SyncEngine, SyncReport},
};
