//! Load results and metadata about where the data came from.

use chrono::{DateTime, Utc};

use crate::record::Record;

/// Result of a `load`, including the records and the source they came from.
#[derive(Debug, Clone)]
pub struct LoadResult {
  /// Merged view: server ∪ local-only ∪ optimistic
  pub records: Vec<Record>,
  /// Where the base data came from
  pub source: DataSource,
  /// When the base data was fetched (for cached sources)
  pub fetched_at: Option<DateTime<Utc>>,
  /// Served from a fallback because the backend could not be read
  pub degraded: bool,
}

impl LoadResult {
  /// Fresh data from the backend.
  pub fn from_network(records: Vec<Record>) -> Self {
    Self {
      records,
      source: DataSource::Network,
      fetched_at: Some(Utc::now()),
      degraded: false,
    }
  }

  /// Data served from the in-memory cache within its ttl.
  pub fn from_cache(records: Vec<Record>) -> Self {
    Self {
      records,
      source: DataSource::CacheFresh,
      fetched_at: None,
      degraded: false,
    }
  }

  /// Fallback data after the backend could not be reached.
  pub fn degraded(
    records: Vec<Record>,
    source: DataSource,
    fetched_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      records,
      source,
      fetched_at,
      degraded: true,
    }
  }
}

/// Indicates where loaded data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fresh data from the backend
  Network,
  /// In-memory cache, still within its ttl
  CacheFresh,
  /// Persisted snapshot past its ttl, served because the backend failed
  CacheStale,
  /// Local mutation store only
  Local,
  /// Caller-supplied default dataset
  Default,
}

impl std::fmt::Display for DataSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      DataSource::Network => "network",
      DataSource::CacheFresh => "cache",
      DataSource::CacheStale => "stale cache",
      DataSource::Local => "local data",
      DataSource::Default => "default dataset",
    };
    f.write_str(label)
  }
}
