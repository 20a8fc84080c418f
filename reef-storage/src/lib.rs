//! Storage collaborator for the reef connection core.
//!
//! The connection core only depends on the [`store::Storage`] trait; [`memory::MemoryStore`] is
//! the in-process engine used by the server binary and by socket-level tests.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{Storage, StoredValue};
