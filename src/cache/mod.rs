//! Read caching and durable storage.
//!
//! This module provides:
//! - A TTL cache that serves fresh collections from memory
//! - A persisted snapshot of each collection for degraded reads
//! - The key/value storage the local stores persist through

mod layer;
mod source;
mod storage;
mod ttl;

pub use layer::CollectionCache;
pub use source::{DataSource, LoadResult};
pub use storage::{
  data_dir, read_json, write_json, KvStore, MemoryKv, SqliteKv, CURRENT_SESSION_KEY,
};
pub use ttl::{Clock, SystemClock};

#[cfg(test)]
pub use ttl::ManualClock;
