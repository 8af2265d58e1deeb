//! Subcommands and argument parsing
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use crate::record::{Fields, RecordId};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Show the merged record list with stock counters
  #[command(visible_alias = "ls")]
  List {
    /// Bypass the cache and reload from the backend
    #[arg(short, long)]
    refresh: bool,
  },
  /// Case-insensitive search on the search field
  Search { query: String },
  /// Create a record from field assignments (nama=Pen stok=10)
  Create {
    #[arg(required = true, value_name = "FIELD=VALUE")]
    fields: Vec<String>,
  },
  /// Update fields of a record
  Update {
    id: String,
    #[arg(required = true, value_name = "FIELD=VALUE")]
    fields: Vec<String>,
  },
  /// Delete a record
  #[command(visible_alias = "rm")]
  Delete { id: String },
  /// Replay pending changes now
  Sync,
  /// Drop every local change and pending operation
  Discard {
    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
  },
  /// List pending operations
  Queue,
  /// Show backend, cache and queue status
  Status,
  /// Keep running and sync on an interval
  Watch {
    /// Seconds between sync attempts (default: sync.interval_secs)
    #[arg(short, long)]
    interval: Option<u64>,
  },
}

/// Parse `field=value` assignments into a field bag.
///
/// Values that parse as JSON (numbers, booleans, null) keep their type;
/// anything else is taken as a string.
pub fn parse_assignments(assignments: &[String]) -> Result<Fields> {
  let mut fields = Fields::new();

  for assignment in assignments {
    let (key, raw) = assignment
      .split_once('=')
      .ok_or_else(|| eyre!("Expected FIELD=VALUE, got '{}'", assignment))?;
    let key = key.trim();
    if key.is_empty() {
      return Err(eyre!("Missing field name in '{}'", assignment));
    }

    let value = match serde_json::from_str::<Value>(raw.trim()) {
      Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
      _ => Value::String(raw.to_string()),
    };
    fields.insert(key.to_string(), value);
  }

  Ok(fields)
}

pub fn parse_id(raw: &str) -> RecordId {
  match raw.parse() {
    Ok(id) => id,
    Err(never) => match never {},
  }
}
