use crate::backend::{RestBackend, RetryPolicy};
use crate::cache::{KvStore, LoadResult, MemoryKv, SqliteKv, CURRENT_SESSION_KEY};
use crate::commands::{parse_assignments, parse_id, Command};
use crate::config::Config;
use crate::event::{self, EventHandler, SyncEvent};
use crate::record::{Record, StockSummary};
use crate::sync::{DrainReport, MutationOutcome, MutationTicket, RecordSynchronizer, SyncOptions};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Durable storage shared by the synchronizer
  kv: Arc<dyn KvStore>,

  /// Sync layer for the configured resource
  sync: RecordSynchronizer,

  /// Notifications from the sync layer
  events: EventHandler,
}

impl App {
  /// Wire up storage, backend and synchronizer. `ephemeral` keeps all local
  /// state in memory for this run only.
  pub async fn new(config: Config, ephemeral: bool) -> Result<Self> {
    let kv: Arc<dyn KvStore> = if ephemeral {
      Arc::new(MemoryKv::new())
    } else {
      match &config.storage.path {
        Some(path) => Arc::new(SqliteKv::open_at(path)?),
        None => Arc::new(SqliteKv::open()?),
      }
    };

    let retry = RetryPolicy::new(
      config.retry.max_attempts,
      Duration::from_millis(config.retry.backoff_ms),
    );
    let backend = Arc::new(RestBackend::new(&config.backend, retry)?);

    let mut options = SyncOptions::from_config(&config);
    if let Some(path) = &config.resource.default_dataset {
      options.default_dataset = load_dataset(path)?;
    }

    let (tx, events) = event::channel();
    let sync = RecordSynchronizer::builder(&config.resource.name, backend, kv.clone())
      .events(tx)
      .options(options)
      .build()?;

    info!(
      resource = %config.resource.name,
      backend = %config.backend.url,
      ephemeral,
      "Synchronizer ready"
    );

    Ok(Self {
      config,
      kv,
      sync,
      events,
    })
  }

  pub async fn run(&mut self, command: Command) -> Result<()> {
    let result = self.dispatch(command).await;
    self.flush_events();
    result
  }

  async fn dispatch(&mut self, command: Command) -> Result<()> {
    match command {
      Command::List { refresh } => {
        let loaded = self.sync.load(refresh).await?;
        print_source(&loaded);
        print_records(&loaded.records, &self.config.resource.search_field);
        print_summary(&self.sync.summary().await, &loaded.records);
        let unconfirmed = loaded
          .records
          .iter()
          .filter(|r| r.provenance.is_unconfirmed())
          .count();
        if unconfirmed > 0 {
          println!("{} record(s) with changes the backend has not confirmed", unconfirmed);
        }
      }
      Command::Search { query } => {
        self.sync.load(false).await?;
        let found = self.sync.search(&query).await;
        print_records(&found, &self.config.resource.search_field);
        println!("{} match(es) for '{}'", found.len(), query);
      }
      Command::Create { fields } => {
        let payload = parse_assignments(&fields)?;
        let ticket = self.sync.create(payload).await?;
        self.report(ticket).await;
      }
      Command::Update { id, fields } => {
        let payload = parse_assignments(&fields)?;
        self.sync.load(false).await?;
        let ticket = self.sync.update(&parse_id(&id), payload).await?;
        self.report(ticket).await;
      }
      Command::Delete { id } => {
        self.sync.load(false).await?;
        let ticket = self.sync.delete(&parse_id(&id)).await?;
        self.report(ticket).await;
      }
      Command::Sync => match self.sync.force_sync().await? {
        Some(report) => print_drain(&report),
        None => println!(
          "Backend unreachable; {} change(s) stay queued",
          self.sync.queue_length().await
        ),
      },
      Command::Discard { yes } => {
        let pending = self.sync.queue_length().await;
        let question = format!("Discard {} pending change(s) and all local data?", pending);
        if !yes && !confirm(&question)? {
          println!("Nothing discarded");
          return Ok(());
        }
        let loaded = self.sync.discard_local_data().await?;
        println!("Local data discarded; {} records from {}", loaded.records.len(), loaded.source);
      }
      Command::Queue => self.print_queue().await,
      Command::Status => self.print_status().await?,
      Command::Watch { interval } => self.watch(interval).await?,
    }
    Ok(())
  }

  /// Show the optimistic change, then wait for the backend's verdict.
  async fn report(&mut self, ticket: MutationTicket) {
    let optimistic = ticket.optimistic().id.clone();
    println!("Applied locally: {}", optimistic);

    match ticket.settled().await {
      MutationOutcome::Synced(record) => println!("Synced: {}", record.id),
      MutationOutcome::Queued { op, reason } => {
        println!("Queued as {} ({}); it will sync when the backend is back", op, reason)
      }
      MutationOutcome::Cancelled => println!("Removed local record {}", optimistic),
      MutationOutcome::Failed(message) => eprintln!("Error: {}", message),
    }
  }

  async fn print_queue(&self) {
    let ops = self.sync.pending_operations().await;
    if ops.is_empty() {
      println!("No pending operations");
      return;
    }

    for op in &ops {
      let target = op
        .subject()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
      println!(
        "{}  {:<6}  {:<24}  {}  attempts={}{}",
        op.id,
        op.kind.to_string(),
        target,
        op.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
        op.attempts,
        op.last_error
          .as_deref()
          .map(|e| format!("  last error: {}", e))
          .unwrap_or_default()
      );
    }
    println!("{} pending operation(s)", ops.len());
  }

  async fn print_status(&self) -> Result<()> {
    let online = self.sync.is_online().await;
    println!("Resource:  {}", self.sync.resource());
    println!(
      "Backend:   {} ({})",
      self.config.backend.url,
      if online { "reachable" } else { "unreachable" }
    );
    println!("Queue:     {} pending", self.sync.queue_length().await);

    match self.kv.get(CURRENT_SESSION_KEY)? {
      Some(raw) => println!("Session:   {}", describe_session(&raw)),
      None => println!("Session:   none"),
    }
    Ok(())
  }

  /// Keep syncing on an interval until interrupted.
  async fn watch(&mut self, interval: Option<u64>) -> Result<()> {
    let interval = Duration::from_secs(interval.unwrap_or(self.config.sync.interval_secs).max(1));

    let loaded = self.sync.load(false).await?;
    print_source(&loaded);
    println!(
      "Watching {} every {}s, Ctrl-C to stop",
      self.sync.resource(),
      interval.as_secs()
    );

    let auto_sync = self.sync.spawn_auto_sync(interval);
    loop {
      tokio::select! {
        event = self.events.next() => match event {
          Some(event) => print_event(&event),
          None => break,
        },
        _ = tokio::signal::ctrl_c() => break,
      }
    }
    auto_sync.abort();

    println!("Stopped; {} change(s) pending", self.sync.queue_length().await);
    Ok(())
  }

  fn flush_events(&mut self) {
    for event in self.events.drain() {
      print_event(&event);
    }
  }
}

/// Read a JSON array of records.
fn load_dataset(path: &Path) -> Result<Vec<Record>> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read default dataset {}: {}", path.display(), e))?;
  serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse default dataset {}: {}", path.display(), e))
}

fn confirm(question: &str) -> Result<bool> {
  print!("{} [y/N] ", question);
  std::io::stdout().flush()?;

  let mut answer = String::new();
  std::io::stdin().lock().read_line(&mut answer)?;
  Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn describe_session(raw: &str) -> String {
  match serde_json::from_str::<Value>(raw) {
    Ok(Value::Object(map)) => ["username", "name", "email"]
      .iter()
      .find_map(|key| map.get(*key).and_then(Value::as_str))
      .map(String::from)
      .unwrap_or_else(|| raw.to_string()),
    _ => raw.to_string(),
  }
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Warning(_) | SyncEvent::Degraded { .. } | SyncEvent::Rejected { .. } => {
      eprintln!("! {}", event)
    }
    _ => eprintln!("> {}", event),
  }
}

fn print_source(loaded: &LoadResult) {
  if loaded.degraded {
    let age = loaded
      .fetched_at
      .map(|at| format!(", fetched {}", at.format("%Y-%m-%d %H:%M")))
      .unwrap_or_default();
    eprintln!("Offline: showing {}{}", loaded.source, age);
  }
}

fn print_records(records: &[Record], title_field: &str) {
  for record in records {
    let title = record.field_str(title_field).unwrap_or("");
    let rest: Vec<String> = record
      .fields
      .iter()
      .filter(|(key, _)| key.as_str() != title_field)
      .map(|(key, value)| match value {
        Value::String(s) => format!("{}={}", key, s),
        other => format!("{}={}", key, other),
      })
      .collect();

    println!(
      "{} {:>10}  {:<28}  {}",
      record.provenance.marker(),
      record.id.to_string(),
      title,
      rest.join(" ")
    );
  }
}

fn print_summary(summary: &StockSummary, records: &[Record]) {
  if !records.iter().any(|r| r.fields.contains_key("stok")) {
    println!("{} records", summary.total);
    return;
  }
  println!(
    "{} items: {} available, {} low, {} out of stock",
    summary.total, summary.available, summary.low, summary.out_of_stock
  );
}

fn print_drain(report: &DrainReport) {
  if report.skipped {
    println!("A sync is already running");
    return;
  }
  println!(
    "Synced {} change(s); {} failed, {} waiting, {} dropped, {} remaining",
    report.applied, report.failed, report.deferred, report.rejected, report.remaining
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_describe_session() {
    assert_eq!(describe_session(r#"{"id": 1, "username": "admin"}"#), "admin");
    assert_eq!(describe_session(r#"{"id": 1}"#), r#"{"id": 1}"#);
    assert_eq!(describe_session("not json"), "not json");
  }

  #[test]
  fn test_load_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("barang.json");
    std::fs::write(&path, r#"[{"id": 1, "nama": "Laptop", "stok": 5}]"#).unwrap();

    let records = load_dataset(&path).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].field_str("nama"), Some("Laptop"));

    assert!(load_dataset(&dir.path().join("missing.json")).is_err());
  }
}
