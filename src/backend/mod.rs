//! Remote REST backend: the trait the synchronizer talks to, its reqwest
//! implementation, retries and health probing.

mod client;
mod error;
mod health;
mod retry;

use async_trait::async_trait;
use std::time::Duration;

use crate::record::{Fields, Record};

pub use client::{RestBackend, UpdateMethod};
pub use error::{BackendError, ErrorClass};
pub use health::HealthProber;
pub use retry::RetryPolicy;

/// Conventional resource endpoints of the backend.
///
/// Used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Lightweight reachability request.
  async fn probe(&self) -> Result<(), BackendError>;

  /// `GET /api/<resource>/`.
  async fn list(&self, resource: &str, timeout: Duration) -> Result<Vec<Record>, BackendError>;

  /// `POST /api/<resource>/`. Returns the created record when the response
  /// carries one.
  async fn create(&self, resource: &str, payload: &Fields) -> Result<Option<Record>, BackendError>;

  /// `PUT` or `PATCH /api/<resource>/<id>/`.
  async fn update(
    &self,
    resource: &str,
    id: i64,
    payload: &Fields,
  ) -> Result<Option<Record>, BackendError>;

  /// `DELETE /api/<resource>/<id>/`.
  async fn delete(&self, resource: &str, id: i64) -> Result<(), BackendError>;
}

#[cfg(test)]
pub mod fake;
