//! In-memory key/value cache with a time-to-live.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Source of the current time. Injected so expiry can be tested.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

#[derive(Debug, Clone)]
struct Entry<V> {
  value: V,
  stored_at: DateTime<Utc>,
}

/// Cache whose entries expire `ttl` after they were stored.
///
/// Values are cloned on the way in and on the way out, so callers never
/// alias the stored copy.
pub struct TtlCache<V: Clone> {
  entries: HashMap<String, Entry<V>>,
  ttl: Duration,
  clock: std::sync::Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(ttl: Duration, clock: std::sync::Arc<dyn Clock>) -> Self {
    Self {
      entries: HashMap::new(),
      ttl,
      clock,
    }
  }

  /// Store a copy of `value`, overwriting any prior entry.
  pub fn set(&mut self, key: &str, value: &V) {
    let stored_at = self.clock.now();
    self.insert_at(key, value, stored_at);
  }

  /// Store a copy of `value` as if it had been stored at `stored_at`.
  pub fn insert_at(&mut self, key: &str, value: &V, stored_at: DateTime<Utc>) {
    self.entries.insert(
      key.to_string(),
      Entry {
        value: value.clone(),
        stored_at,
      },
    );
  }

  /// Replace the value of a live entry without renewing its timestamp.
  ///
  /// Returns false (and stores nothing) when the entry is missing or expired.
  pub fn replace(&mut self, key: &str, value: &V) -> bool {
    let now = self.clock.now();
    match self.entries.get_mut(key) {
      Some(entry) if now - entry.stored_at < self.ttl => {
        entry.value = value.clone();
        true
      }
      _ => false,
    }
  }

  /// Return a copy if the entry is younger than the ttl; evict it otherwise.
  pub fn get(&mut self, key: &str) -> Option<V> {
    let now = self.clock.now();
    match self.entries.get(key) {
      Some(entry) if now - entry.stored_at < self.ttl => Some(entry.value.clone()),
      Some(_) => {
        self.entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// When the entry for `key` was stored, if present.
  pub fn stored_at(&self, key: &str) -> Option<DateTime<Utc>> {
    self.entries.get(key).map(|e| e.stored_at)
  }

  #[cfg(test)]
  pub fn clear(&mut self) {
    self.entries.clear();
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock {
  now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: std::sync::Mutex::new(Utc::now()),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

#[cfg(test)]
impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn cache(clock: &Arc<ManualClock>) -> TtlCache<Vec<u32>> {
    TtlCache::new(Duration::minutes(5), clock.clone())
  }

  #[test]
  fn test_get_within_ttl() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);

    cache.set("barang", &vec![1, 2]);
    clock.advance(Duration::minutes(5) - Duration::milliseconds(1));

    assert_eq!(cache.get("barang"), Some(vec![1, 2]));
  }

  #[test]
  fn test_expired_entry_is_evicted_once() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);

    cache.set("barang", &vec![1]);
    clock.advance(Duration::minutes(5));

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("barang"), None);
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.get("barang"), None);
  }

  #[test]
  fn test_returned_values_do_not_alias() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);
    let mut original = vec![1];
    cache.set("barang", &original);
    original.push(2);

    let mut first = cache.get("barang").unwrap();
    first.push(3);

    assert_eq!(cache.get("barang"), Some(vec![1]));
  }

  #[test]
  fn test_set_overwrites_and_renews() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);

    cache.set("barang", &vec![1]);
    clock.advance(Duration::minutes(4));
    cache.set("barang", &vec![2]);
    clock.advance(Duration::minutes(4));

    assert_eq!(cache.get("barang"), Some(vec![2]));
  }

  #[test]
  fn test_replace_keeps_timestamp() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);

    assert!(!cache.replace("barang", &vec![9]));

    cache.set("barang", &vec![1]);
    clock.advance(Duration::minutes(4));
    assert!(cache.replace("barang", &vec![2]));
    clock.advance(Duration::minutes(1));

    assert_eq!(cache.get("barang"), None);
  }

  #[test]
  fn test_clear() {
    let clock = Arc::new(ManualClock::new());
    let mut cache = cache(&clock);
    cache.set("a", &vec![]);
    cache.set("b", &vec![]);

    assert_eq!(cache.len(), 2);
    cache.clear();
    assert!(cache.is_empty());
  }
}
