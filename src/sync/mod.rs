//! Offline-resilient synchronization of one resource collection.
//!
//! [`RecordSynchronizer`] is the only way callers touch records. Reads go
//! through the TTL cache and fall back to local data when the backend is
//! down. Mutations are applied optimistically, confirmed in the background,
//! and queued for later replay when the backend cannot take them.

mod reconciler;
mod state;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, HealthProber};
use crate::cache::{Clock, CollectionCache, DataSource, KvStore, LoadResult, SystemClock};
use crate::config::Config;
use crate::event::{EventSender, SyncEvent};
use crate::record::{Fields, OpId, Provenance, Record, RecordId, StockSummary};
use crate::store::{LocalMutationStore, OpKind, OperationDraft, PendingOperation, PendingQueue};
use crate::validate::validator_for;

pub use reconciler::DrainReport;
use reconciler::Reconciler;
use state::{BusyGuard, Shared, SyncState};

/// Errors returned to callers of the synchronizer.
///
/// Backend failures never show up here; they turn into queued operations
/// and events.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("Invalid input: {0}")]
  Validation(String),
  #[error("Another change is still being saved, try again in a moment")]
  Busy,
  #[error("Record {0} not found")]
  NotFound(RecordId),
  #[error("Local storage failed: {0}")]
  Storage(color_eyre::Report),
}

impl From<color_eyre::Report> for SyncError {
  fn from(e: color_eyre::Report) -> Self {
    SyncError::Storage(e)
  }
}

/// Tunables of a synchronizer.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  pub ttl: chrono::Duration,
  pub read_timeout: Duration,
  /// Timeout for reloads triggered by auto-sync
  pub background_timeout: Duration,
  /// Field matched by `search`
  pub search_field: String,
  /// Drop queued operations the backend refuses with a 4xx
  pub discard_rejected: bool,
  /// Last-resort data when nothing else is available
  pub default_dataset: Vec<Record>,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      ttl: chrono::Duration::minutes(5),
      read_timeout: Duration::from_secs(10),
      background_timeout: Duration::from_secs(3),
      search_field: "nama".to_string(),
      discard_rejected: false,
      default_dataset: Vec::new(),
    }
  }
}

impl SyncOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      ttl: chrono::Duration::seconds(config.cache.ttl_secs as i64),
      read_timeout: Duration::from_secs(config.backend.read_timeout_secs),
      background_timeout: Duration::from_secs(config.backend.background_timeout_secs),
      search_field: config.resource.search_field.clone(),
      discard_rejected: config.sync.discard_rejected,
      default_dataset: Vec::new(),
    }
  }
}

/// Final state of a mutation once its background task is done.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The backend confirmed it. For deletes, the record that was removed.
  Synced(Record),
  /// Stored in the pending queue for a later drain
  Queued { op: OpId, reason: String },
  /// Deleted a record that had never reached the backend
  Cancelled,
  /// Local storage failed while settling
  Failed(String),
}

/// Handle to a mutation: the optimistic state right away, the outcome later.
pub struct MutationTicket {
  optimistic: Record,
  handle: JoinHandle<MutationOutcome>,
}

impl MutationTicket {
  /// The record as it was optimistically applied (or removed, for deletes).
  pub fn optimistic(&self) -> &Record {
    &self.optimistic
  }

  /// Wait for the background confirmation.
  pub async fn settled(self) -> MutationOutcome {
    match self.handle.await {
      Ok(outcome) => outcome,
      Err(e) => MutationOutcome::Failed(format!("Background task failed: {}", e)),
    }
  }
}

/// A mutation handed to the background task.
enum Mutation {
  Create {
    id: RecordId,
    payload: Fields,
  },
  Update {
    id: RecordId,
    payload: Fields,
  },
  Delete {
    id: RecordId,
    snapshot: Record,
    position: usize,
    overlay: Option<Record>,
  },
}

impl Mutation {
  fn id(&self) -> &RecordId {
    match self {
      Mutation::Create { id, .. } | Mutation::Update { id, .. } | Mutation::Delete { id, .. } => id,
    }
  }

  fn kind(&self) -> OpKind {
    match self {
      Mutation::Create { .. } => OpKind::Create,
      Mutation::Update { .. } => OpKind::Update,
      Mutation::Delete { .. } => OpKind::Delete,
    }
  }
}

pub struct SynchronizerBuilder {
  resource: String,
  backend: Arc<dyn Backend>,
  kv: Arc<dyn KvStore>,
  clock: Arc<dyn Clock>,
  events: Option<EventSender>,
  options: SyncOptions,
}

impl SynchronizerBuilder {
  #[cfg(test)]
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn events(mut self, events: EventSender) -> Self {
    self.events = Some(events);
    self
  }

  pub fn options(mut self, options: SyncOptions) -> Self {
    self.options = options;
    self
  }

  /// Open the persisted stores and build the synchronizer.
  ///
  /// Until the first `load`, the view holds only local entries.
  pub fn build(self) -> color_eyre::Result<RecordSynchronizer> {
    let cache =
      CollectionCache::open(self.kv.clone(), &self.resource, self.options.ttl, self.clock)?;
    let overrides = LocalMutationStore::open(self.kv.clone(), &self.resource)?;
    let queue = PendingQueue::open(self.kv, &self.resource)?;

    let mut state = SyncState {
      base: Vec::new(),
      base_source: DataSource::Local,
      view: Vec::new(),
      cache,
      overrides,
      queue,
      cancelled: HashSet::new(),
    };
    state.rebuild(Vec::new(), DataSource::Local);

    let validator = validator_for(&self.resource);

    Ok(RecordSynchronizer {
      shared: Arc::new(Shared {
        prober: HealthProber::new(self.backend.clone()),
        backend: self.backend,
        resource: self.resource,
        state: Mutex::new(state),
        events: self.events,
        options: self.options,
        validator,
        mutating: Arc::new(AtomicBool::new(false)),
        draining: Arc::new(AtomicBool::new(false)),
      }),
    })
  }
}

/// Public surface of the sync layer for one resource.
#[derive(Clone)]
pub struct RecordSynchronizer {
  shared: Arc<Shared>,
}

impl RecordSynchronizer {
  pub fn builder(
    resource: &str,
    backend: Arc<dyn Backend>,
    kv: Arc<dyn KvStore>,
  ) -> SynchronizerBuilder {
    SynchronizerBuilder {
      resource: resource.to_string(),
      backend,
      kv,
      clock: Arc::new(SystemClock),
      events: None,
      options: SyncOptions::default(),
    }
  }

  pub fn resource(&self) -> &str {
    &self.shared.resource
  }

  /// Probe the backend now.
  pub async fn is_online(&self) -> bool {
    self.shared.prober.check().await
  }

  /// Load the collection, from the cache when fresh unless `force_refresh`.
  pub async fn load(&self, force_refresh: bool) -> Result<LoadResult, SyncError> {
    self.load_with(force_refresh, self.shared.read_timeout()).await
  }

  async fn load_with(
    &self,
    force_refresh: bool,
    timeout: Duration,
  ) -> Result<LoadResult, SyncError> {
    let resource = &self.shared.resource;

    if !force_refresh {
      let mut state = self.shared.state.lock().await;
      if let Some(base) = state.cache.fresh() {
        debug!(resource = %resource, "Serving collection from cache");
        state.rebuild(base, DataSource::CacheFresh);
        return Ok(LoadResult::from_cache(state.view.clone()));
      }
    }

    let reason = if self.shared.prober.check().await {
      match self.shared.backend.list(resource, timeout).await {
        Ok(records) => {
          let mut state = self.shared.state.lock().await;
          state.cache.store(&records)?;
          state.rebuild(records, DataSource::Network);

          let count = state.view.len();
          info!(resource = %resource, count, "Collection loaded from backend");
          self.shared.emit(SyncEvent::Refreshed {
            source: DataSource::Network,
            count,
          });
          return Ok(LoadResult::from_network(state.view.clone()));
        }
        Err(e) => {
          warn!(resource = %resource, error = %e, "Failed to fetch collection");
          e.to_string()
        }
      }
    } else {
      "backend unreachable".to_string()
    };

    self.fallback(reason).await
  }

  /// Serve the best local data: fresh cache, stale snapshot, local entries,
  /// then the default dataset.
  async fn fallback(&self, reason: String) -> Result<LoadResult, SyncError> {
    let mut state = self.shared.state.lock().await;

    let (base, source, fetched_at) = if let Some(records) =
      state.cache.fresh().filter(|r| !r.is_empty())
    {
      (records, DataSource::CacheFresh, None)
    } else if let Some(snapshot) = state.cache.stale()?.filter(|s| !s.records.is_empty()) {
      (snapshot.records, DataSource::CacheStale, Some(snapshot.fetched_at))
    } else if !state.overrides.is_empty() {
      (Vec::new(), DataSource::Local, None)
    } else {
      (self.shared.options.default_dataset.clone(), DataSource::Default, None)
    };

    state.rebuild(base, source);

    warn!(
      resource = %self.shared.resource,
      source = %source,
      count = state.view.len(),
      reason = %reason,
      "Serving degraded data"
    );
    self.shared.emit(SyncEvent::Degraded { source, reason });

    Ok(LoadResult::degraded(state.view.clone(), source, fetched_at))
  }

  /// Create a record under a provisional id.
  pub async fn create(&self, payload: Fields) -> Result<MutationTicket, SyncError> {
    let payload = self
      .shared
      .validator
      .validate_create(payload)
      .map_err(SyncError::Validation)?;
    let guard = BusyGuard::acquire(&self.shared.mutating).ok_or(SyncError::Busy)?;

    let id = RecordId::provisional();
    let optimistic =
      Record::new(id.clone(), payload.clone()).with_provenance(Provenance::Optimistic(None));
    {
      let mut state = self.shared.state.lock().await;
      state
        .overrides
        .put_tagged(optimistic.clone(), Provenance::Optimistic(None))?;
      state.view.push(optimistic.clone());
    }
    debug!(resource = %self.shared.resource, id = %id, "Optimistic create applied");

    Ok(self.spawn(guard, optimistic, Mutation::Create { id, payload }))
  }

  /// Merge `patch` into the record with `id`.
  pub async fn update(&self, id: &RecordId, patch: Fields) -> Result<MutationTicket, SyncError> {
    let patch = self
      .shared
      .validator
      .validate_update(patch)
      .map_err(SyncError::Validation)?;
    let guard = BusyGuard::acquire(&self.shared.mutating).ok_or(SyncError::Busy)?;

    let optimistic = {
      let mut state = self.shared.state.lock().await;
      let pos = state
        .position(id)
        .ok_or_else(|| SyncError::NotFound(id.clone()))?;

      let mut record = state.view[pos].clone();
      record.merge_fields(&patch);
      record.provenance = Provenance::Optimistic(None);

      state
        .overrides
        .put_tagged(record.clone(), Provenance::Optimistic(None))?;
      state.view[pos] = record.clone();
      record
    };
    debug!(resource = %self.shared.resource, id = %id, "Optimistic update applied");

    // The backend always gets the full field set
    let payload = optimistic.payload();
    Ok(self.spawn(
      guard,
      optimistic,
      Mutation::Update {
        id: id.clone(),
        payload,
      },
    ))
  }

  /// Remove the record with `id` from the view right away.
  pub async fn delete(&self, id: &RecordId) -> Result<MutationTicket, SyncError> {
    let guard = BusyGuard::acquire(&self.shared.mutating).ok_or(SyncError::Busy)?;

    let (snapshot, position, overlay) = {
      let mut state = self.shared.state.lock().await;
      let pos = state
        .position(id)
        .ok_or_else(|| SyncError::NotFound(id.clone()))?;
      let snapshot = state.view.remove(pos);
      let overlay = state.overrides.remove(id)?;
      (snapshot, pos, overlay)
    };
    debug!(resource = %self.shared.resource, id = %id, "Optimistic delete applied");

    Ok(self.spawn(
      guard,
      snapshot.clone(),
      Mutation::Delete {
        id: id.clone(),
        snapshot,
        position,
        overlay,
      },
    ))
  }

  fn spawn(&self, guard: BusyGuard, optimistic: Record, mutation: Mutation) -> MutationTicket {
    let shared = self.shared.clone();
    let handle = tokio::spawn(async move {
      // The mutation lock is held until the outcome is known
      let _guard = guard;
      let kind = mutation.kind();
      let target = mutation.id().clone();
      match settle(&shared, mutation).await {
        Ok(outcome) => outcome,
        Err(e) => {
          error!(kind = %kind, target = %target, error = %e, "Failed to settle mutation");
          MutationOutcome::Failed(e.to_string())
        }
      }
    });
    MutationTicket { optimistic, handle }
  }

  /// Case-insensitive substring match on the search field.
  pub async fn search(&self, query: &str) -> Vec<Record> {
    let needle = query.trim().to_lowercase();
    let field = &self.shared.options.search_field;
    let state = self.shared.state.lock().await;

    state
      .view
      .iter()
      .filter(|r| {
        r.field_str(field)
          .map(|value| value.to_lowercase().contains(&needle))
          .unwrap_or(false)
      })
      .cloned()
      .collect()
  }

  /// Current merged view.
  #[cfg(test)]
  pub async fn records(&self) -> Vec<Record> {
    self.shared.state.lock().await.view.clone()
  }

  pub async fn summary(&self) -> StockSummary {
    StockSummary::from_records(&self.shared.state.lock().await.view)
  }

  pub async fn queue_length(&self) -> usize {
    self.shared.state.lock().await.queue.len()
  }

  pub async fn pending_operations(&self) -> Vec<PendingOperation> {
    self.shared.state.lock().await.queue.all()
  }

  /// Replay the pending queue once.
  pub async fn drain(&self) -> Result<DrainReport, SyncError> {
    Reconciler::new(self.shared.clone()).drain().await
  }

  /// Drain and reload if the backend is reachable. `None` when it is not.
  pub async fn force_sync(&self) -> Result<Option<DrainReport>, SyncError> {
    if !self.shared.prober.check().await {
      self.shared.emit(SyncEvent::Warning(
        "Backend unreachable, pending changes stay queued".to_string(),
      ));
      return Ok(None);
    }

    let report = self.drain().await?;
    self.load(true).await?;
    Ok(Some(report))
  }

  /// Forget every local change and pending operation, then reload.
  pub async fn discard_local_data(&self) -> Result<LoadResult, SyncError> {
    {
      let mut state = self.shared.state.lock().await;
      let dropped = state.queue.len();
      state.overrides.clear()?;
      state.queue.clear()?;
      warn!(resource = %self.shared.resource, dropped, "Local changes discarded");
    }
    self.load(true).await
  }

  /// Periodically drain the queue while the backend is reachable.
  pub fn spawn_auto_sync(&self, interval: Duration) -> JoinHandle<()> {
    let sync = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        if let Err(e) = sync.auto_sync_tick().await {
          error!(resource = %sync.shared.resource, error = %e, "Auto-sync failed");
        }
      }
    })
  }

  async fn auto_sync_tick(&self) -> Result<(), SyncError> {
    if self.shared.state.lock().await.queue.is_empty() || !self.shared.prober.check().await {
      return Ok(());
    }

    let report = self.drain().await?;
    if report.applied > 0 {
      self
        .load_with(true, self.shared.options.background_timeout)
        .await?;
    }
    Ok(())
  }
}

/// Confirm a mutation with the backend, or queue it.
async fn settle(shared: &Shared, mutation: Mutation) -> Result<MutationOutcome, SyncError> {
  let target = mutation.id().clone();

  if let Mutation::Delete { .. } = mutation {
    if target.is_provisional() {
      return cancel(shared, &target).await;
    }
  }

  // Earlier changes to the same record must reach the backend first
  if matches!(mutation, Mutation::Update { .. }) && target.is_provisional() {
    if !shared.state.lock().await.queue.has_pending_create(&target) {
      return unassigned(shared, &target).await;
    }
    return enqueue(shared, mutation, "waiting for the record to be created".into()).await;
  }
  if shared.state.lock().await.queue.latest_for(&target).is_some() {
    return enqueue(shared, mutation, "earlier changes are still pending".into()).await;
  }

  if !shared.prober.check().await {
    return enqueue(shared, mutation, "backend unreachable".into()).await;
  }

  let resource = &shared.resource;
  match &mutation {
    Mutation::Create { id, payload } => match shared.backend.create(resource, payload).await {
      Ok(server) => {
        let mut state = shared.state.lock().await;
        let record = match server {
          Some(server) => {
            let server_id = server.id.clone();
            state.resolve_id(id, &server_id)?;
            state.confirm(&server_id, Some(server))?
          }
          // Without a body the backend took the payload as sent
          None => state.confirm(id, Some(Record::new(id.clone(), payload.clone())))?,
        };
        drop(state);
        Ok(confirmed(shared, OpKind::Create, record))
      }
      Err(e) => enqueue(shared, mutation, e.to_string()).await,
    },
    Mutation::Update { id, payload } => {
      let Some(server_id) = id.server() else {
        return unassigned(shared, id).await;
      };
      match shared.backend.update(resource, server_id, payload).await {
        Ok(server) => {
          let server = server.or_else(|| Some(Record::new(id.clone(), payload.clone())));
          let record = shared.state.lock().await.confirm(id, server)?;
          Ok(confirmed(shared, OpKind::Update, record))
        }
        Err(e) => enqueue(shared, mutation, e.to_string()).await,
      }
    }
    Mutation::Delete { id, snapshot, .. } => {
      let Some(server_id) = id.server() else {
        return cancel(shared, id).await;
      };
      match shared.backend.delete(resource, server_id).await {
        Ok(()) => {}
        Err(e) if e.status() == Some(404) => {
          debug!(id = %id, "Record already gone on the backend");
        }
        Err(e) => return enqueue(shared, mutation, e.to_string()).await,
      }
      shared.state.lock().await.confirm_delete(id)?;
      Ok(confirmed(
        shared,
        OpKind::Delete,
        snapshot.clone().with_provenance(Provenance::Synced),
      ))
    }
  }
}

/// An update to a record whose create went through without a server id. It
/// can never be sent, so the local change is rolled back.
async fn unassigned(shared: &Shared, id: &RecordId) -> Result<MutationOutcome, SyncError> {
  shared.state.lock().await.revert(id)?;
  warn!(resource = %shared.resource, id = %id, "Update targets a record without a server id");

  let message = format!("Record {} has no server id yet; reload and try again", id);
  shared.emit(SyncEvent::Warning(message.clone()));
  Ok(MutationOutcome::Failed(message))
}

fn confirmed(shared: &Shared, kind: OpKind, record: Record) -> MutationOutcome {
  info!(resource = %shared.resource, kind = %kind, id = %record.id, "Mutation confirmed");
  shared.emit(SyncEvent::Confirmed {
    kind,
    id: record.id.clone(),
  });
  MutationOutcome::Synced(record)
}

/// Put a mutation in the pending queue and leave its optimistic state
/// visible. A delete is rolled back to a pending-deletion record.
async fn enqueue(
  shared: &Shared,
  mutation: Mutation,
  reason: String,
) -> Result<MutationOutcome, SyncError> {
  let kind = mutation.kind();
  let target = mutation.id().clone();
  let mut state = shared.state.lock().await;

  let op = match mutation {
    Mutation::Create { id, payload } => {
      let op = state.queue.enqueue(OperationDraft::create(id.clone(), payload))?;
      let provenance = Provenance::Optimistic(Some(op.id));
      state.overrides.retag(&id, provenance.clone())?;
      state.set_view_provenance(&id, provenance);
      op
    }
    Mutation::Update { id, payload } => {
      let op = state.queue.enqueue(OperationDraft::update(id.clone(), payload))?;
      let provenance = Provenance::Optimistic(Some(op.id));
      state.overrides.retag(&id, provenance.clone())?;
      state.set_view_provenance(&id, provenance);
      op
    }
    Mutation::Delete {
      id,
      snapshot,
      position,
      overlay,
    } => {
      let op = state
        .queue
        .enqueue(OperationDraft::delete(id.clone(), snapshot.payload()))?;
      if let Some(overlay) = overlay {
        let provenance = overlay.provenance.clone();
        state.overrides.put_tagged(overlay, provenance)?;
      }
      let position = position.min(state.view.len());
      state
        .view
        .insert(position, snapshot.with_provenance(Provenance::PendingDelete(op.id)));
      shared.emit(SyncEvent::Warning(format!(
        "Could not delete {} now ({}); it stays listed until the delete syncs",
        id, reason
      )));
      op
    }
  };
  drop(state);

  warn!(
    resource = %shared.resource,
    op_id = %op.id,
    kind = %kind,
    target = %target,
    reason = %reason,
    "Mutation queued"
  );
  shared.emit(SyncEvent::Queued {
    kind,
    target,
    op: op.id,
    reason: reason.clone(),
  });

  Ok(MutationOutcome::Queued { op: op.id, reason })
}

/// Delete a record the backend never saw, along with its queued operations.
async fn cancel(shared: &Shared, id: &RecordId) -> Result<MutationOutcome, SyncError> {
  let mut state = shared.state.lock().await;
  let dropped = state.queue.dequeue_matching(|op| op.subject() == Some(id))?;
  if dropped.iter().any(|op| op.kind == OpKind::Create) {
    state.cancelled.insert(id.clone());
  }
  state.overrides.remove(id)?;
  info!(resource = %shared.resource, id = %id, dropped = dropped.len(), "Local record deleted");
  Ok(MutationOutcome::Cancelled)
}
