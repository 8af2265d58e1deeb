use std::sync::Arc;
use tracing::{debug, warn};

use super::Backend;

/// Answers "is the backend reachable right now?".
///
/// Results are never cached; every check is a fresh probe.
#[derive(Clone)]
pub struct HealthProber {
  backend: Arc<dyn Backend>,
}

impl HealthProber {
  pub fn new(backend: Arc<dyn Backend>) -> Self {
    Self { backend }
  }

  pub async fn check(&self) -> bool {
    match self.backend.probe().await {
      Ok(()) => true,
      // 401/403 means something answered. It may be an auth proxy in front
      // of a dead backend, in which case the next call fails and queues.
      Err(e) if e.is_ambiguous() => {
        warn!(error = %e, "Health probe was refused, treating backend as reachable");
        true
      }
      Err(e) => {
        debug!(error = %e, "Health probe failed");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::fake::FakeBackend;
  use crate::backend::BackendError;

  #[tokio::test]
  async fn test_reachable_and_unreachable() {
    let backend = Arc::new(FakeBackend::new());
    let prober = HealthProber::new(backend.clone());
    assert!(prober.check().await);

    backend.set_online(false);
    assert!(!prober.check().await);
  }

  #[tokio::test]
  async fn test_refused_probe_counts_as_healthy() {
    let backend = Arc::new(FakeBackend::new());
    let prober = HealthProber::new(backend.clone());

    backend.fail_probe(BackendError::Status {
      status: 403,
      message: "Forbidden".into(),
    });
    assert!(prober.check().await);

    backend.fail_probe(BackendError::Status {
      status: 503,
      message: "HTTP 503: Service Unavailable".into(),
    });
    assert!(!prober.check().await);
  }
}
