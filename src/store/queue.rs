//! Durable FIFO of mutations awaiting confirmation by the backend.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{read_json, write_json, KvStore};
use crate::record::{Fields, OpId, RecordId};

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
  Create,
  Update,
  Delete,
}

impl std::fmt::Display for OpKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      OpKind::Create => "create",
      OpKind::Update => "update",
      OpKind::Delete => "delete",
    })
  }
}

/// A mutation waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: OpId,
  pub kind: OpKind,
  /// Record the operation applies to. `None` for creates.
  pub target_id: Option<RecordId>,
  /// Provisional id the create was made under, resolved once it replays.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provisional_id: Option<RecordId>,
  pub payload: Fields,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl PendingOperation {
  /// The record this operation concerns, whichever kind it is.
  pub fn subject(&self) -> Option<&RecordId> {
    self.target_id.as_ref().or(self.provisional_id.as_ref())
  }
}

/// An operation before it has been assigned an id and timestamp.
#[derive(Debug, Clone)]
pub struct OperationDraft {
  pub kind: OpKind,
  pub target_id: Option<RecordId>,
  pub provisional_id: Option<RecordId>,
  pub payload: Fields,
}

impl OperationDraft {
  pub fn create(provisional_id: RecordId, payload: Fields) -> Self {
    Self {
      kind: OpKind::Create,
      target_id: None,
      provisional_id: Some(provisional_id),
      payload,
    }
  }

  pub fn update(target_id: RecordId, payload: Fields) -> Self {
    Self {
      kind: OpKind::Update,
      target_id: Some(target_id),
      provisional_id: None,
      payload,
    }
  }

  /// `snapshot` keeps the deleted record's data in case it must be restored.
  pub fn delete(target_id: RecordId, snapshot: Fields) -> Self {
    Self {
      kind: OpKind::Delete,
      target_id: Some(target_id),
      provisional_id: None,
      payload: snapshot,
    }
  }
}

/// Pending operation queue for one resource.
pub struct PendingQueue {
  kv: Arc<dyn KvStore>,
  key: String,
  ops: Vec<PendingOperation>,
}

impl PendingQueue {
  pub fn open(kv: Arc<dyn KvStore>, resource: &str) -> Result<Self> {
    let key = format!("pendingQueue:{}", resource);
    let ops = read_json(kv.as_ref(), &key)?.unwrap_or_default();
    Ok(Self { kv, key, ops })
  }

  /// Append an operation and persist the queue.
  pub fn enqueue(&mut self, draft: OperationDraft) -> Result<PendingOperation> {
    let op = PendingOperation {
      id: uuid::Uuid::new_v4(),
      kind: draft.kind,
      target_id: draft.target_id,
      provisional_id: draft.provisional_id,
      payload: draft.payload,
      enqueued_at: Utc::now(),
      attempts: 0,
      last_error: None,
    };
    self.ops.push(op.clone());
    self.persist()?;
    Ok(op)
  }

  /// Remove every operation matching `predicate` and return them in order.
  pub fn dequeue_matching<F>(&mut self, predicate: F) -> Result<Vec<PendingOperation>>
  where
    F: Fn(&PendingOperation) -> bool,
  {
    let (removed, kept): (Vec<_>, Vec<_>) = self.ops.drain(..).partition(|op| predicate(op));
    self.ops = kept;
    if !removed.is_empty() {
      self.persist()?;
    }
    Ok(removed)
  }

  /// All operations in FIFO order.
  pub fn all(&self) -> Vec<PendingOperation> {
    self.ops.clone()
  }

  pub fn contains(&self, id: &OpId) -> bool {
    self.ops.iter().any(|op| &op.id == id)
  }

  /// Point every operation targeting `from` at `to`.
  pub fn rewrite_target(&mut self, from: &RecordId, to: &RecordId) -> Result<usize> {
    let mut rewritten = 0;
    for op in self.ops.iter_mut() {
      if op.target_id.as_ref() == Some(from) {
        op.target_id = Some(to.clone());
        rewritten += 1;
      }
    }
    if rewritten > 0 {
      self.persist()?;
    }
    Ok(rewritten)
  }

  /// Note a failed replay attempt.
  pub fn record_failure(&mut self, id: &OpId, error: &str) -> Result<()> {
    if let Some(op) = self.ops.iter_mut().find(|op| &op.id == id) {
      op.attempts += 1;
      op.last_error = Some(error.to_string());
      return self.persist();
    }
    Ok(())
  }

  /// Whether a create made under `provisional` is still waiting.
  pub fn has_pending_create(&self, provisional: &RecordId) -> bool {
    self
      .ops
      .iter()
      .any(|op| op.kind == OpKind::Create && op.provisional_id.as_ref() == Some(provisional))
  }

  /// Id of the queued delete for `id`, if any.
  pub fn pending_delete_for(&self, id: &RecordId) -> Option<OpId> {
    self
      .ops
      .iter()
      .find(|op| op.kind == OpKind::Delete && op.target_id.as_ref() == Some(id))
      .map(|op| op.id)
  }

  /// Most recent operation concerning `id`, if any.
  pub fn latest_for(&self, id: &RecordId) -> Option<&PendingOperation> {
    self.ops.iter().rev().find(|op| op.subject() == Some(id))
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub fn clear(&mut self) -> Result<()> {
    self.ops.clear();
    self.kv.remove(&self.key)
  }

  fn persist(&self) -> Result<()> {
    write_json(self.kv.as_ref(), &self.key, &self.ops)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryKv;
  use crate::record::fields;
  use serde_json::json;

  fn queue(kv: &MemoryKv) -> PendingQueue {
    PendingQueue::open(Arc::new(kv.clone()), "barang").unwrap()
  }

  #[test]
  fn test_enqueue_assigns_ids_and_keeps_fifo_order() {
    let kv = MemoryKv::new();
    let mut q = queue(&kv);

    let a = q
      .enqueue(OperationDraft::update(RecordId::Server(7), fields(json!({"stok": 3}))))
      .unwrap();
    let b = q
      .enqueue(OperationDraft::delete(RecordId::Server(8), fields(json!({}))))
      .unwrap();

    assert_ne!(a.id, b.id);
    let ids: Vec<_> = queue(&kv).all().into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
  }

  #[test]
  fn test_dequeue_matching_removes_and_persists() {
    let kv = MemoryKv::new();
    let mut q = queue(&kv);
    let a = q
      .enqueue(OperationDraft::update(RecordId::Server(1), fields(json!({}))))
      .unwrap();
    q.enqueue(OperationDraft::update(RecordId::Server(2), fields(json!({}))))
      .unwrap();

    let removed = q.dequeue_matching(|op| op.id == a.id).unwrap();

    assert_eq!(removed.len(), 1);
    assert_eq!(queue(&kv).len(), 1);
    assert!(!queue(&kv).contains(&a.id));
  }

  #[test]
  fn test_rewrite_target_resolves_provisional_ids() {
    let kv = MemoryKv::new();
    let mut q = queue(&kv);
    let provisional = RecordId::Provisional("local-1-0".into());

    q.enqueue(OperationDraft::create(provisional.clone(), fields(json!({"nama": "Pen"}))))
      .unwrap();
    q.enqueue(OperationDraft::update(provisional.clone(), fields(json!({"stok": 1}))))
      .unwrap();

    assert!(q.has_pending_create(&provisional));
    assert_eq!(q.rewrite_target(&provisional, &RecordId::Server(11)).unwrap(), 1);
    assert_eq!(
      queue(&kv).all()[1].target_id,
      Some(RecordId::Server(11))
    );
  }

  #[test]
  fn test_record_failure_counts_attempts() {
    let kv = MemoryKv::new();
    let mut q = queue(&kv);
    let op = q
      .enqueue(OperationDraft::delete(RecordId::Server(3), fields(json!({}))))
      .unwrap();

    q.record_failure(&op.id, "HTTP 500: Internal Server Error").unwrap();
    q.record_failure(&op.id, "Network error").unwrap();

    let stored = &queue(&kv).all()[0];
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("Network error"));
    assert_eq!(q.pending_delete_for(&RecordId::Server(3)), Some(op.id));
  }

  #[test]
  fn test_latest_for_and_clear() {
    let kv = MemoryKv::new();
    let mut q = queue(&kv);
    q.enqueue(OperationDraft::update(RecordId::Server(5), fields(json!({"stok": 1}))))
      .unwrap();
    let last = q
      .enqueue(OperationDraft::update(RecordId::Server(5), fields(json!({"stok": 2}))))
      .unwrap();

    assert_eq!(q.latest_for(&RecordId::Server(5)).map(|op| op.id), Some(last.id));

    q.clear().unwrap();
    assert!(queue(&kv).is_empty());
  }
}
