//! tally-state: checkpoint storage.
//! Provides an in-memory store, a directory-of-JSON-files store and an optional
//! RocksDB backend (enable with `--features rocksdb`).

pub mod dir;
pub mod mem;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use dir::DirCheckpointStore;
pub use mem::InMemoryCheckpointStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbCheckpointStore;

/// Number of completed checkpoints a store keeps unless configured otherwise.
pub const DEFAULT_RETAINED: usize = 3;
