//! In-process backend used by tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{Backend, BackendError};
use crate::record::{Fields, Record, RecordId};

/// A call the fake received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  Probe,
  List,
  Create(Fields),
  Update(i64, Fields),
  Delete(i64),
}

struct State {
  online: bool,
  records: Vec<Record>,
  next_id: i64,
  calls: Vec<Call>,
  probe_failures: VecDeque<BackendError>,
  failures: VecDeque<BackendError>,
  latency: Duration,
  empty_replies: bool,
}

/// Scriptable backend holding its records in memory.
pub struct FakeBackend {
  state: Mutex<State>,
}

impl FakeBackend {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State {
        online: true,
        records: Vec::new(),
        next_id: 1,
        calls: Vec::new(),
        probe_failures: VecDeque::new(),
        failures: VecDeque::new(),
        latency: Duration::ZERO,
        empty_replies: false,
      }),
    }
  }

  /// Seed server records. New ids continue after the highest seeded one.
  pub fn with_records(records: Vec<Record>) -> Self {
    let fake = Self::new();
    {
      let mut state = fake.state.lock().unwrap();
      state.next_id = records.iter().filter_map(|r| r.id.server()).max().unwrap_or(0) + 1;
      state.records = records;
    }
    fake
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().online = online;
  }

  /// Delay every call, to widen race windows.
  pub fn set_latency(&self, latency: Duration) {
    self.state.lock().unwrap().latency = latency;
  }

  /// Answer creates and updates without a body.
  pub fn set_empty_replies(&self, empty: bool) {
    self.state.lock().unwrap().empty_replies = empty;
  }

  /// Fail the next probe with `error`.
  pub fn fail_probe(&self, error: BackendError) {
    self.state.lock().unwrap().probe_failures.push_back(error);
  }

  /// Fail the next data call (list, create, update, delete) with `error`.
  pub fn fail_next(&self, error: BackendError) {
    self.state.lock().unwrap().failures.push_back(error);
  }

  pub fn records(&self) -> Vec<Record> {
    self.state.lock().unwrap().records.clone()
  }

  pub fn calls(&self) -> Vec<Call> {
    self.state.lock().unwrap().calls.clone()
  }

  /// Calls other than probes.
  pub fn data_calls(&self) -> Vec<Call> {
    self
      .calls()
      .into_iter()
      .filter(|c| *c != Call::Probe)
      .collect()
  }

  async fn enter(&self, call: Call) -> Result<(), BackendError> {
    let latency = self.state.lock().unwrap().latency;
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    let mut state = self.state.lock().unwrap();
    let is_probe = call == Call::Probe;
    state.calls.push(call);

    if !state.online {
      return Err(BackendError::Network("connection refused".into()));
    }
    let scripted = if is_probe {
      state.probe_failures.pop_front()
    } else {
      state.failures.pop_front()
    };
    match scripted {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

fn not_found() -> BackendError {
  BackendError::Status {
    status: 404,
    message: "Not found.".into(),
  }
}

#[async_trait]
impl Backend for FakeBackend {
  async fn probe(&self) -> Result<(), BackendError> {
    self.enter(Call::Probe).await
  }

  async fn list(&self, _resource: &str, _timeout: Duration) -> Result<Vec<Record>, BackendError> {
    self.enter(Call::List).await?;
    Ok(self.records())
  }

  async fn create(
    &self,
    _resource: &str,
    payload: &Fields,
  ) -> Result<Option<Record>, BackendError> {
    self.enter(Call::Create(payload.clone())).await?;

    let mut state = self.state.lock().unwrap();
    let id = state.next_id;
    state.next_id += 1;
    let record = Record::new(RecordId::Server(id), payload.clone());
    state.records.push(record.clone());
    Ok((!state.empty_replies).then_some(record))
  }

  async fn update(
    &self,
    _resource: &str,
    id: i64,
    payload: &Fields,
  ) -> Result<Option<Record>, BackendError> {
    self.enter(Call::Update(id, payload.clone())).await?;

    let mut state = self.state.lock().unwrap();
    let record = state
      .records
      .iter_mut()
      .find(|r| r.id == RecordId::Server(id))
      .ok_or_else(not_found)?;
    record.merge_fields(payload);
    let record = record.clone();
    Ok((!state.empty_replies).then_some(record))
  }

  async fn delete(&self, _resource: &str, id: i64) -> Result<(), BackendError> {
    self.enter(Call::Delete(id)).await?;

    let mut state = self.state.lock().unwrap();
    let before = state.records.len();
    state.records.retain(|r| r.id != RecordId::Server(id));
    if state.records.len() == before {
      return Err(not_found());
    }
    Ok(())
  }
}
