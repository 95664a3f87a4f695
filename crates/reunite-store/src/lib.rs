//! reunite-store: persistence for face descriptors and missing-child records.
//!
//! The registry's only shared mutable state lives here. Both backends are
//! safe to share between threads and resolve duplicate registrations
//! atomically.

pub mod cipher;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use cipher::DescriptorCipher;
pub use memory::{MemoryDirectory, MemoryStore};
pub use sqlite::{SqliteDirectory, SqliteStore};
pub use traits::{DescriptorStore, RecordDirectory, StoreError};
