//! Collection cache: the in-memory TTL cache plus its persisted snapshot.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::storage::{read_json, write_json, KvStore};
use super::ttl::{Clock, TtlCache};
use crate::record::Record;

/// Last known-good snapshot of a collection, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSnapshot {
  pub records: Vec<Record>,
  pub fetched_at: DateTime<Utc>,
}

/// Cache for one resource collection.
///
/// Reads within the ttl are served from memory. The snapshot is also written
/// to durable storage so that a stale copy survives restarts and can serve
/// degraded reads.
pub struct CollectionCache {
  resource: String,
  memory: TtlCache<Vec<Record>>,
  kv: Arc<dyn KvStore>,
  clock: Arc<dyn Clock>,
}

impl CollectionCache {
  /// Create the cache and hydrate it from the persisted snapshot.
  ///
  /// A snapshot still inside the ttl is served from memory straight away.
  pub fn open(
    kv: Arc<dyn KvStore>,
    resource: &str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let mut cache = Self {
      resource: resource.to_string(),
      memory: TtlCache::new(ttl, clock.clone()),
      kv,
      clock,
    };

    if let Some(snapshot) = cache.stale()? {
      cache
        .memory
        .insert_at(&cache.resource, &snapshot.records, snapshot.fetched_at);
    }

    Ok(cache)
  }

  fn snapshot_key(&self) -> String {
    format!("cache:{}", self.resource)
  }

  /// Records if the cache is within its ttl.
  pub fn fresh(&mut self) -> Option<Vec<Record>> {
    self.memory.get(&self.resource)
  }

  /// Store authoritative data, renewing the ttl.
  pub fn store(&mut self, records: &[Record]) -> Result<()> {
    let records = records.to_vec();
    self.memory.set(&self.resource, &records);
    self.persist(records, self.clock.now())
  }

  /// Mirror a local change without renewing the ttl.
  pub fn update(&mut self, records: &[Record]) -> Result<()> {
    let records = records.to_vec();
    self.memory.replace(&self.resource, &records);
    let fetched_at = self
      .memory
      .stored_at(&self.resource)
      .unwrap_or_else(|| self.clock.now());
    self.persist(records, fetched_at)
  }

  /// Persisted snapshot regardless of age.
  pub fn stale(&self) -> Result<Option<CachedSnapshot>> {
    read_json(self.kv.as_ref(), &self.snapshot_key())
  }

  fn persist(&self, records: Vec<Record>, fetched_at: DateTime<Utc>) -> Result<()> {
    let snapshot = CachedSnapshot {
      records,
      fetched_at,
    };
    write_json(self.kv.as_ref(), &self.snapshot_key(), &snapshot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryKv;
  use crate::cache::ttl::ManualClock;
  use crate::record::{fields, RecordId};
  use serde_json::json;

  fn item(id: i64, nama: &str) -> Record {
    Record::new(RecordId::Server(id), fields(json!({"nama": nama})))
  }

  #[test]
  fn test_fresh_until_ttl_then_stale_snapshot_remains() {
    let clock = Arc::new(ManualClock::new());
    let kv = Arc::new(MemoryKv::new());
    let mut cache =
      CollectionCache::open(kv, "barang", Duration::minutes(5), clock.clone()).unwrap();

    cache.store(&[item(1, "Laptop")]).unwrap();
    assert_eq!(cache.fresh().map(|r| r.len()), Some(1));

    clock.advance(Duration::minutes(6));
    assert!(cache.fresh().is_none());

    let snapshot = cache.stale().unwrap().unwrap();
    assert_eq!(snapshot.records, vec![item(1, "Laptop")]);
  }

  #[test]
  fn test_reopen_hydrates_from_snapshot() {
    let clock = Arc::new(ManualClock::new());
    let kv = MemoryKv::new();
    {
      let mut cache =
        CollectionCache::open(Arc::new(kv.clone()), "barang", Duration::minutes(5), clock.clone())
          .unwrap();
      cache.store(&[item(1, "Laptop")]).unwrap();
    }

    let mut cache =
      CollectionCache::open(Arc::new(kv), "barang", Duration::minutes(5), clock.clone()).unwrap();
    assert_eq!(cache.fresh(), Some(vec![item(1, "Laptop")]));
  }

  #[test]
  fn test_update_does_not_renew_ttl() {
    let clock = Arc::new(ManualClock::new());
    let kv = Arc::new(MemoryKv::new());
    let mut cache =
      CollectionCache::open(kv, "barang", Duration::minutes(5), clock.clone()).unwrap();

    cache.store(&[item(1, "Laptop")]).unwrap();
    clock.advance(Duration::minutes(3));
    cache.update(&[item(1, "Laptop"), item(2, "Mouse")]).unwrap();
    assert_eq!(cache.fresh().map(|r| r.len()), Some(2));

    clock.advance(Duration::minutes(3));
    assert!(cache.fresh().is_none());
    assert_eq!(cache.stale().unwrap().unwrap().records.len(), 2);
  }
}
