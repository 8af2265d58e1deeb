//! State shared between the façade, its background tasks and the reconciler.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::SyncOptions;
use crate::backend::{Backend, HealthProber};
use crate::cache::{CollectionCache, DataSource};
use crate::event::{EventSender, SyncEvent};
use crate::record::{merge_collection, Provenance, Record, RecordId};
use crate::store::{LocalMutationStore, PendingQueue};
use crate::validate::Validator;

/// Everything guarded by the state lock. Never held across a backend call.
pub(crate) struct SyncState {
  /// Server data as last seen, before local overrides
  pub base: Vec<Record>,
  /// Where `base` came from
  pub base_source: DataSource,
  /// What callers see
  pub view: Vec<Record>,
  pub cache: CollectionCache,
  pub overrides: LocalMutationStore,
  pub queue: PendingQueue,
  /// Provisional ids deleted locally after their create was queued. A drain
  /// that was already sending the create deletes the new server record.
  pub cancelled: HashSet<RecordId>,
}

impl SyncState {
  /// Overlay local entries and queued deletes on server data.
  pub fn merged(&self, base: Vec<Record>) -> Vec<Record> {
    let mut merged = merge_collection(base, &self.overrides.all());
    for record in merged.iter_mut() {
      if let Some(op) = self.queue.pending_delete_for(&record.id) {
        record.provenance = Provenance::PendingDelete(op);
      }
    }
    merged
  }

  /// Replace the base data and rebuild the view from it.
  pub fn rebuild(&mut self, base: Vec<Record>, source: DataSource) {
    self.view = self.merged(base.clone());
    self.base = base;
    self.base_source = source;
  }

  pub fn position(&self, id: &RecordId) -> Option<usize> {
    self.view.iter().position(|r| &r.id == id)
  }

  /// Replace the view record with the same id, or append it.
  pub fn upsert_view(&mut self, record: Record) {
    match self.position(&record.id) {
      Some(pos) => self.view[pos] = record,
      None => self.view.push(record),
    }
  }

  pub fn set_view_provenance(&mut self, id: &RecordId, provenance: Provenance) {
    if let Some(pos) = self.position(id) {
      self.view[pos].provenance = provenance;
    }
  }

  /// Point a resolved provisional id at its server id everywhere.
  pub fn resolve_id(&mut self, provisional: &RecordId, server: &RecordId) -> Result<()> {
    self.queue.rewrite_target(provisional, server)?;
    self.overrides.rekey(provisional, server)?;
    if let Some(pos) = self.position(provisional) {
      self.view[pos].id = server.clone();
    }
    Ok(())
  }

  /// The backend accepted a create or update of `id`.
  ///
  /// With later operations for the record still queued, the local state stays
  /// on top and keeps pointing at the newest operation.
  pub fn confirm(&mut self, id: &RecordId, authoritative: Option<Record>) -> Result<Record> {
    if let Some(server) = authoritative.clone() {
      self.upsert_base(server.with_provenance(Provenance::Synced));
    }

    let later = self.queue.latest_for(id).map(|op| op.id);
    let confirmed = match later {
      Some(op) => {
        let provenance = Provenance::Optimistic(Some(op));
        self.overrides.retag(id, provenance.clone())?;
        self.set_view_provenance(id, provenance);
        self.view_record(id)
      }
      None => {
        let local = self.overrides.remove(id)?;
        authoritative
          .or_else(|| self.view_record(id))
          .or(local)
          .map(|r| r.with_provenance(Provenance::Synced))
      }
    };

    self.mirror_cache()?;

    let confirmed = confirmed.unwrap_or_else(|| {
      warn!(id = %id, "Confirmed record is missing from the view");
      Record::new(id.clone(), Default::default())
    });
    if later.is_none() {
      self.upsert_view(confirmed.clone());
    }
    Ok(confirmed)
  }

  /// The backend deleted `id`, or never had it.
  pub fn confirm_delete(&mut self, id: &RecordId) -> Result<()> {
    self.view.retain(|r| &r.id != id);
    self.base.retain(|r| &r.id != id);
    self.overrides.remove(id)?;
    self.mirror_cache()
  }

  /// Drop the local state of `id` and show the server copy again, if any.
  pub fn revert(&mut self, id: &RecordId) -> Result<()> {
    if self.queue.latest_for(id).is_none() {
      self.overrides.remove(id)?;
    }
    match self.base.iter().find(|r| &r.id == id).cloned() {
      Some(server) => self.upsert_view(server),
      None => self.view.retain(|r| &r.id != id),
    }
    Ok(())
  }

  fn view_record(&self, id: &RecordId) -> Option<Record> {
    self.view.iter().find(|r| &r.id == id).cloned()
  }

  fn upsert_base(&mut self, record: Record) {
    match self.base.iter_mut().find(|r| r.id == record.id) {
      Some(existing) => *existing = record,
      None => self.base.push(record),
    }
  }

  /// Fallback data (overrides, default dataset) never reaches the cache.
  fn mirror_cache(&mut self) -> Result<()> {
    match self.base_source {
      DataSource::Network | DataSource::CacheFresh | DataSource::CacheStale => {
        self.cache.update(&self.base)
      }
      DataSource::Local | DataSource::Default => Ok(()),
    }
  }
}

/// Everything a synchronizer and its background tasks share.
pub(crate) struct Shared {
  pub resource: String,
  pub backend: Arc<dyn Backend>,
  pub prober: HealthProber,
  pub state: Mutex<SyncState>,
  pub events: Option<EventSender>,
  pub options: SyncOptions,
  pub validator: Box<dyn Validator>,
  pub mutating: Arc<AtomicBool>,
  pub draining: Arc<AtomicBool>,
}

impl Shared {
  pub fn emit(&self, event: SyncEvent) {
    if let Some(tx) = &self.events {
      // Nobody listening is fine
      let _ = tx.send(event);
    }
  }

  pub fn read_timeout(&self) -> Duration {
    self.options.read_timeout
  }
}

/// Holds a busy flag for as long as it lives.
pub(crate) struct BusyGuard {
  flag: Arc<AtomicBool>,
}

impl BusyGuard {
  /// Take the flag, or `None` if someone else holds it.
  pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self { flag: flag.clone() })
  }
}

impl Drop for BusyGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}
