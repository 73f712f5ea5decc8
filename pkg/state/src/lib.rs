//! Control lease coordination over a CAS document store.
//!
//! Sessions never talk to each other directly. They share two documents in
//! a replicated store: a lease-protected control document and a telemetry
//! document written by the device. Exclusive control is arbitrated purely by
//! compare-and-swap on the store's revision token.

pub mod cache;
pub mod client;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod memory;

pub use client::{CouchStore, DocumentStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CoordinatorConfig, LeaseCoordinator, LeaseRole};
pub use error::{CoordinatorError, StoreError};
pub use memory::MemoryStore;
