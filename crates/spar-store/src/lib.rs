//! # spar-store
//!
//! Storage boundary for the Spar pipeline.
//!
//! The [`Store`] trait is the concurrency contract: the atomic claim
//! (`queued` -> `processing`) it exposes is the only serialization primitive
//! in the system. Any backend offering atomic row-level conditional writes
//! can implement it; [`MemoryStore`] is the reference adapter and provides
//! the same guarantee under a single write lock.

mod feed;
mod memory;
mod store;

pub use feed::{EventBatch, EventFeed};
pub use memory::MemoryStore;
pub use store::{EventNotice, NewEvent, Store};
