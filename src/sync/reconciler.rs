//! Replays the pending queue against the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{BusyGuard, Shared};
use super::SyncError;
use crate::backend::ErrorClass;
use crate::event::SyncEvent;
use crate::record::{Record, RecordId};
use crate::store::{OpKind, OperationDraft, PendingOperation};

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub applied: usize,
  pub failed: usize,
  /// Left queued because their target has no server id yet
  pub deferred: usize,
  /// Dropped after the backend refused them
  pub rejected: usize,
  pub remaining: usize,
  /// Another drain was already running
  pub skipped: bool,
}

enum Reply {
  Saved(Option<Record>),
  Deleted,
}

/// How a confirmed operation ended up in local state.
enum Applied {
  /// Merged; carries the id mapping when a create resolved one
  Merged(Option<(RecordId, RecordId)>),
  /// The record was deleted locally while its create was in flight. The
  /// delete for the new server record is queued.
  Withdrawn(PendingOperation),
  /// Left the queue while in flight (local data was discarded)
  Dropped,
}

pub(crate) struct Reconciler {
  shared: Arc<Shared>,
}

impl Reconciler {
  pub fn new(shared: Arc<Shared>) -> Self {
    Self { shared }
  }

  /// Send every queued operation once, oldest first.
  ///
  /// The queue is snapshotted up front; operations enqueued meanwhile wait
  /// for the next drain.
  pub async fn drain(&self) -> Result<DrainReport, SyncError> {
    let Some(_guard) = BusyGuard::acquire(&self.shared.draining) else {
      debug!(resource = %self.shared.resource, "Drain already running");
      return Ok(DrainReport {
        skipped: true,
        ..DrainReport::default()
      });
    };

    let mut work: VecDeque<PendingOperation> = {
      let mut state = self.shared.state.lock().await;
      // Only creates sent by this drain can be withdrawn
      state.cancelled.clear();
      state.queue.all().into()
    };
    let mut report = DrainReport::default();
    // Provisional ids resolved during this drain; the snapshot predates them
    let mut resolved: HashMap<RecordId, RecordId> = HashMap::new();

    while let Some(op) = work.pop_front() {
      // Cancelled or discarded since the snapshot
      if !self.shared.state.lock().await.queue.contains(&op.id) {
        debug!(op_id = %op.id, kind = %op.kind, "Operation left the queue, skipping");
        continue;
      }

      let target = op
        .target_id
        .clone()
        .map(|t| resolved.get(&t).cloned().unwrap_or(t));

      let result = match (op.kind, target.as_ref().and_then(RecordId::server)) {
        (OpKind::Create, _) => self
          .shared
          .backend
          .create(&self.shared.resource, &op.payload)
          .await
          .map(Reply::Saved),
        (OpKind::Update, Some(id)) => self
          .shared
          .backend
          .update(&self.shared.resource, id, &op.payload)
          .await
          .map(Reply::Saved),
        (OpKind::Delete, Some(id)) => {
          match self.shared.backend.delete(&self.shared.resource, id).await {
            Ok(()) => Ok(Reply::Deleted),
            // Already gone counts as deleted
            Err(e) if e.status() == Some(404) => Ok(Reply::Deleted),
            Err(e) => Err(e),
          }
        }
        (_, None) => {
          if self.awaits_create(target.as_ref()).await {
            debug!(op_id = %op.id, kind = %op.kind, "Target not created yet, deferring");
            report.deferred += 1;
          } else {
            // Its create went through without telling us the server id
            self
              .reject(&op, target.as_ref(), "record was never assigned a server id")
              .await?;
            report.rejected += 1;
          }
          continue;
        }
      };

      match result {
        Ok(reply) => {
          match self.apply(&op, target.as_ref(), reply).await? {
            Applied::Merged(Some((from, to))) => {
              resolved.insert(from, to);
            }
            Applied::Merged(None) | Applied::Dropped => {}
            Applied::Withdrawn(delete) => work.push_back(delete),
          }
          report.applied += 1;
        }
        Err(e) if self.shared.options.discard_rejected && e.class() == ErrorClass::ClientSide => {
          self.reject(&op, target.as_ref(), &e.to_string()).await?;
          report.rejected += 1;
        }
        Err(e) => {
          warn!(op_id = %op.id, kind = %op.kind, error = %e, "Replay failed, keeping operation");
          self
            .shared
            .state
            .lock()
            .await
            .queue
            .record_failure(&op.id, &e.to_string())?;
          report.failed += 1;
        }
      }
    }

    {
      let mut state = self.shared.state.lock().await;
      state.cancelled.clear();
      report.remaining = state.queue.len();
    }

    if report.applied > 0 {
      info!(
        resource = %self.shared.resource,
        applied = report.applied,
        remaining = report.remaining,
        "Pending operations synchronized"
      );
      self.shared.emit(SyncEvent::Synchronized {
        applied: report.applied,
        remaining: report.remaining,
      });
    }

    Ok(report)
  }

  /// Whether `target` is a provisional id whose create is still queued.
  async fn awaits_create(&self, target: Option<&RecordId>) -> bool {
    match target {
      Some(id) => self.shared.state.lock().await.queue.has_pending_create(id),
      None => false,
    }
  }

  /// Merge a confirmed operation into local state.
  async fn apply(
    &self,
    op: &PendingOperation,
    target: Option<&RecordId>,
    reply: Reply,
  ) -> Result<Applied, SyncError> {
    let mut state = self.shared.state.lock().await;

    if state.queue.dequeue_matching(|o| o.id == op.id)?.is_empty() {
      let cancelled = op
        .provisional_id
        .as_ref()
        .is_some_and(|id| state.cancelled.remove(id));

      return match reply {
        Reply::Saved(Some(server)) if cancelled => {
          warn!(
            op_id = %op.id,
            id = %server.id,
            "Record was deleted while its create was in flight, deleting it on the backend"
          );
          let delete = state
            .queue
            .enqueue(OperationDraft::delete(server.id.clone(), server.payload()))?;
          Ok(Applied::Withdrawn(delete))
        }
        _ => {
          debug!(op_id = %op.id, "Operation confirmed after leaving the queue");
          Ok(Applied::Dropped)
        }
      };
    }

    match reply {
      Reply::Deleted => {
        if let Some(id) = target {
          state.confirm_delete(id)?;
        }
        Ok(Applied::Merged(None))
      }
      Reply::Saved(server) => {
        let mut resolution = None;
        let mut id = target.cloned();

        if op.kind == OpKind::Create {
          id = op.provisional_id.clone();
          match (&op.provisional_id, server.as_ref()) {
            (Some(provisional), Some(server)) => {
              state.resolve_id(provisional, &server.id)?;
              resolution = Some((provisional.clone(), server.id.clone()));
              id = Some(server.id.clone());
            }
            _ => warn!(op_id = %op.id, "Create confirmed without a record, id stays provisional"),
          }
        }

        if let Some(id) = id {
          // Without a body the backend took the payload as sent
          let server = server.or_else(|| Some(Record::new(id.clone(), op.payload.clone())));
          state.confirm(&id, server)?;
        }
        Ok(Applied::Merged(resolution))
      }
    }
  }

  async fn reject(
    &self,
    op: &PendingOperation,
    target: Option<&RecordId>,
    message: &str,
  ) -> Result<(), SyncError> {
    warn!(
      op_id = %op.id,
      kind = %op.kind,
      error = %message,
      "Operation cannot be replayed, dropping it"
    );

    let mut state = self.shared.state.lock().await;
    state.queue.dequeue_matching(|o| o.id == op.id)?;
    if let Some(subject) = target.or(op.provisional_id.as_ref()) {
      state.revert(subject)?;
    }

    self.shared.emit(SyncEvent::Rejected {
      op: op.id,
      message: message.to_string(),
    });
    Ok(())
  }
}
