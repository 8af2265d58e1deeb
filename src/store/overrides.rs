//! Local mutation store: records created or edited locally, keyed by id.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{read_json, write_json, KvStore};
use crate::record::{Provenance, Record, RecordId};

/// Durable overlay of local record state for one resource.
///
/// Every mutating call writes the whole store back to durable storage before
/// returning.
pub struct LocalMutationStore {
  kv: Arc<dyn KvStore>,
  key: String,
  entries: Vec<Record>,
}

impl LocalMutationStore {
  /// Load the store for `resource`, skipping entries that no longer parse.
  pub fn open(kv: Arc<dyn KvStore>, resource: &str) -> Result<Self> {
    let key = format!("localOverrides:{}", resource);
    let raw: Vec<Value> = read_json(kv.as_ref(), &key)?.unwrap_or_default();

    let entries = raw
      .into_iter()
      .filter_map(|value| match serde_json::from_value::<Record>(value) {
        Ok(record) => Some(record),
        Err(e) => {
          warn!(key = %key, error = %e, "Skipping malformed local override");
          None
        }
      })
      .collect();

    Ok(Self { kv, key, entries })
  }

  /// Upsert `record`, tagging it local-only.
  #[cfg(test)]
  pub fn put(&mut self, record: Record) -> Result<()> {
    self.put_tagged(record, Provenance::LocalOnly)
  }

  /// Upsert `record` with an explicit provenance. Fields of an existing entry
  /// are merged, not replaced.
  pub fn put_tagged(&mut self, record: Record, provenance: Provenance) -> Result<()> {
    match self.entries.iter_mut().find(|e| e.id == record.id) {
      Some(existing) => {
        existing.merge_fields(&record.fields);
        existing.provenance = provenance;
      }
      None => self.entries.push(record.with_provenance(provenance)),
    }
    self.persist()
  }

  /// Change only the provenance of an existing entry.
  pub fn retag(&mut self, id: &RecordId, provenance: Provenance) -> Result<()> {
    if let Some(entry) = self.entries.iter_mut().find(|e| &e.id == id) {
      entry.provenance = provenance;
      return self.persist();
    }
    Ok(())
  }

  #[cfg(test)]
  pub fn get(&self, id: &RecordId) -> Option<Record> {
    self.entries.iter().find(|e| &e.id == id).cloned()
  }

  /// All entries in insertion order.
  pub fn all(&self) -> Vec<Record> {
    self.entries.clone()
  }

  pub fn remove(&mut self, id: &RecordId) -> Result<Option<Record>> {
    let Some(pos) = self.entries.iter().position(|e| &e.id == id) else {
      return Ok(None);
    };
    let removed = self.entries.remove(pos);
    self.persist()?;
    Ok(Some(removed))
  }

  /// Move an entry to a new id (provisional id resolved by the backend).
  pub fn rekey(&mut self, from: &RecordId, to: &RecordId) -> Result<()> {
    if let Some(entry) = self.entries.iter_mut().find(|e| &e.id == from) {
      entry.id = to.clone();
      return self.persist();
    }
    Ok(())
  }

  pub fn clear(&mut self) -> Result<()> {
    self.entries.clear();
    self.kv.remove(&self.key)
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn persist(&self) -> Result<()> {
    write_json(self.kv.as_ref(), &self.key, &self.entries)
  }
}
