//! Resource records and their provenance.
//!
//! A record is a known field set (`id` and `provenance`) plus an open bag of
//! scalar fields as returned by the backend. The bag is kept as a JSON object
//! so that unknown backend fields survive a round trip through local storage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Open field bag of a record.
pub type Fields = Map<String, Value>;

/// Locally unique identifier of a pending operation.
pub type OpId = uuid::Uuid;

static PROVISIONAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identity of a record.
///
/// Server ids serialize as plain integers, provisional ids as strings, so the
/// backend's JSON deserializes directly into `Server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  /// Assigned by the backend
  Server(i64),
  /// Generated locally before the first successful create
  Provisional(String),
}

impl RecordId {
  /// Generate a fresh provisional id (`local-<unix-millis>-<seq>`).
  pub fn provisional() -> Self {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = PROVISIONAL_SEQ.fetch_add(1, Ordering::Relaxed);
    RecordId::Provisional(format!("local-{}-{}", millis, seq))
  }

  pub fn is_provisional(&self) -> bool {
    matches!(self, RecordId::Provisional(_))
  }

  /// The server id, if the backend assigned one.
  pub fn server(&self) -> Option<i64> {
    match self {
      RecordId::Server(id) => Some(*id),
      RecordId::Provisional(_) => None,
    }
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordId::Server(id) => write!(f, "{}", id),
      RecordId::Provisional(id) => f.write_str(id),
    }
  }
}

impl FromStr for RecordId {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.trim().parse::<i64>() {
      Ok(id) => RecordId::Server(id),
      Err(_) => RecordId::Provisional(s.trim().to_string()),
    })
  }
}

impl From<i64> for RecordId {
  fn from(id: i64) -> Self {
    RecordId::Server(id)
  }
}

/// Where the visible state of a record comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "op", rename_all = "snake_case")]
pub enum Provenance {
  /// Server data that has not been touched locally
  #[default]
  Pristine,
  /// Local change awaiting confirmation. `None` while the direct backend call
  /// is in flight, `Some` once the change sits in the pending queue.
  Optimistic(Option<OpId>),
  /// Exists only in the local mutation store
  LocalOnly,
  /// Confirmed by the backend
  Synced,
  /// A delete failed and was rolled back; the delete is still queued
  PendingDelete(OpId),
}

impl Provenance {
  pub fn is_pristine(&self) -> bool {
    matches!(self, Provenance::Pristine)
  }

  /// Whether the record carries a change the backend has not confirmed.
  pub fn is_unconfirmed(&self) -> bool {
    matches!(
      self,
      Provenance::Optimistic(_) | Provenance::LocalOnly | Provenance::PendingDelete(_)
    )
  }

  /// Short marker used by list output.
  pub fn marker(&self) -> &'static str {
    match self {
      Provenance::Pristine => " ",
      Provenance::Optimistic(_) => "~",
      Provenance::LocalOnly => "L",
      Provenance::Synced => "✓",
      Provenance::PendingDelete(_) => "x",
    }
  }
}

/// A single resource record (e.g. an inventory item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  #[serde(
    rename = "_provenance",
    default,
    skip_serializing_if = "Provenance::is_pristine"
  )]
  pub provenance: Provenance,
  #[serde(flatten)]
  pub fields: Fields,
}

impl Record {
  pub fn new(id: RecordId, fields: Fields) -> Self {
    Self {
      id,
      provenance: Provenance::Pristine,
      fields,
    }
  }

  pub fn with_provenance(mut self, provenance: Provenance) -> Self {
    self.provenance = provenance;
    self
  }

  /// Overwrite fields present in `patch`, keeping the rest.
  pub fn merge_fields(&mut self, patch: &Fields) {
    for (key, value) in patch {
      if key == "id" {
        continue;
      }
      self.fields.insert(key.clone(), value.clone());
    }
  }

  pub fn field_str(&self, name: &str) -> Option<&str> {
    self.fields.get(name).and_then(Value::as_str)
  }

  pub fn field_f64(&self, name: &str) -> Option<f64> {
    self.fields.get(name).and_then(Value::as_f64)
  }

  pub fn field_bool(&self, name: &str) -> bool {
    self
      .fields
      .get(name)
      .and_then(Value::as_bool)
      .unwrap_or(false)
  }

  /// Field bag sent to the backend. Never contains `id`.
  pub fn payload(&self) -> Fields {
    let mut fields = self.fields.clone();
    fields.remove("id");
    fields
  }
}

/// Merge server data with local override entries.
///
/// Local entries whose id matches a server record overwrite its fields and
/// provenance; local-only ids are appended in local order.
pub fn merge_collection(server: Vec<Record>, local: &[Record]) -> Vec<Record> {
  let mut merged = server;

  for entry in local {
    match merged.iter_mut().find(|r| r.id == entry.id) {
      Some(existing) => {
        existing.merge_fields(&entry.fields);
        existing.provenance = entry.provenance.clone();
      }
      None => merged.push(entry.clone()),
    }
  }

  merged
}

/// Stock counters shown next to the item list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockSummary {
  pub total: usize,
  pub out_of_stock: usize,
  pub low: usize,
  pub available: usize,
}

impl StockSummary {
  /// Backend-computed flags win; otherwise derive from `stok` and `minimum`.
  pub fn from_records(records: &[Record]) -> Self {
    let mut summary = StockSummary::default();

    for record in records {
      summary.total += 1;
      let stok = record.field_f64("stok").unwrap_or(0.0);
      let minimum = record.field_f64("minimum").unwrap_or(0.0);

      if record.field_bool("is_out_of_stock") || stok <= 0.0 {
        summary.out_of_stock += 1;
      } else if record.field_bool("is_low_stock") || stok <= minimum {
        summary.low += 1;
      } else {
        summary.available += 1;
      }
    }

    summary
  }
}

/// Build a field bag from a JSON object literal.
#[cfg(test)]
pub fn fields(value: Value) -> Fields {
  match value {
    Value::Object(map) => map,
    other => panic!("expected object, got {}", other),
  }
}
