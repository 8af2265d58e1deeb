use tokio::sync::mpsc;

use crate::cache::DataSource;
use crate::record::{OpId, RecordId};
use crate::store::OpKind;

/// Notifications raised by the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// A load finished with fresh data
  Refreshed { source: DataSource, count: usize },
  /// The backend could not be reached; data came from a fallback
  Degraded { source: DataSource, reason: String },
  /// The backend confirmed a mutation
  Confirmed { kind: OpKind, id: RecordId },
  /// A mutation could not be sent and was queued
  Queued {
    kind: OpKind,
    target: RecordId,
    op: OpId,
    reason: String,
  },
  /// Something the user should know about (e.g. a delete that was rolled back)
  Warning(String),
  /// A drain applied queued operations
  Synchronized { applied: usize, remaining: usize },
  /// The backend refused a queued operation and it was dropped
  Rejected { op: OpId, message: String },
}

impl std::fmt::Display for SyncEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SyncEvent::Refreshed { source, count } => {
        write!(f, "Loaded {} records from {}", count, source)
      }
      SyncEvent::Degraded { source, reason } => {
        write!(f, "Offline mode: showing {} ({})", source, reason)
      }
      SyncEvent::Confirmed { kind, id } => write!(f, "Saved: {} {}", kind, id),
      SyncEvent::Queued {
        kind,
        target,
        reason,
        ..
      } => write!(
        f,
        "Saved locally, will sync when online: {} {} ({})",
        kind, target, reason
      ),
      SyncEvent::Warning(message) => f.write_str(message),
      SyncEvent::Synchronized { applied, remaining } => write!(
        f,
        "Synchronized {} pending changes ({} remaining)",
        applied, remaining
      ),
      SyncEvent::Rejected { op, message } => {
        write!(f, "Dropped pending change {}: {}", op, message)
      }
    }
  }
}

/// Sending half, cloned into every background task
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// Receiving half of the notification channel
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

/// Create a connected sender and handler
pub fn channel() -> (EventSender, EventHandler) {
  let (tx, rx) = mpsc::unbounded_channel();
  (tx, EventHandler { rx })
}

impl EventHandler {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Everything queued so far, without waiting
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_channel_delivers_in_order() {
    let (tx, mut events) = channel();
    tx.send(SyncEvent::Warning("first".into())).unwrap();
    tx.send(SyncEvent::Synchronized {
      applied: 2,
      remaining: 0,
    })
    .unwrap();

    assert_eq!(events.next().await, Some(SyncEvent::Warning("first".into())));
    assert_eq!(
      events.drain(),
      vec![SyncEvent::Synchronized {
        applied: 2,
        remaining: 0
      }]
    );
    assert!(events.drain().is_empty());
  }

  #[test]
  fn test_display() {
    let event = SyncEvent::Confirmed {
      kind: OpKind::Update,
      id: RecordId::Server(7),
    };
    assert_eq!(event.to_string(), "Saved: update 7");
  }
}
