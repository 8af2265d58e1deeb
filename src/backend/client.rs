//! reqwest implementation of [`Backend`] for `<url>/api/<resource>/`
//! endpoints.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::error::{error_message, BackendError};
use super::retry::RetryPolicy;
use super::Backend;
use crate::config::{BackendConfig, Config};
use crate::record::{Fields, Provenance, Record};

/// Which verb carries updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMethod {
  #[default]
  Put,
  Patch,
}

/// REST backend client
#[derive(Clone)]
pub struct RestBackend {
  http: reqwest::Client,
  base: Url,
  probe_path: String,
  update_method: UpdateMethod,
  read_timeout: Duration,
  probe_timeout: Duration,
  retry: RetryPolicy,
  /// Creates are only repeated when the first attempt surely did not land
  create_retry: RetryPolicy,
}

impl RestBackend {
  pub fn new(config: &BackendConfig, retry: RetryPolicy) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(token) = Config::get_api_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid backend url {}: {}", config.url, e))?;
    // Url::join replaces the last segment unless the path ends with a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    Ok(Self {
      http,
      base,
      probe_path: config.probe_path.clone(),
      update_method: config.update_method,
      read_timeout: Duration::from_secs(config.read_timeout_secs),
      probe_timeout: Duration::from_secs(config.probe_timeout_secs),
      create_retry: retry.clone().with_retryable(BackendError::is_resendable),
      retry,
    })
  }

  /// `<base>/api/<resource>/` or `<base>/api/<resource>/<id>/`
  fn endpoint(&self, resource: &str, id: Option<i64>) -> Result<Url, BackendError> {
    let path = match id {
      Some(id) => format!("api/{}/{}/", resource.trim_matches('/'), id),
      None => format!("api/{}/", resource.trim_matches('/')),
    };
    self
      .base
      .join(&path)
      .map_err(|e| BackendError::Network(format!("Invalid endpoint {}: {}", path, e)))
  }

  /// Send one request and read the JSON body, if any.
  async fn execute(
    &self,
    method: Method,
    url: Url,
    body: Option<&Fields>,
    timeout: Duration,
  ) -> Result<Option<Value>, BackendError> {
    debug!(%method, %url, "Backend request");

    let mut request = self.http.request(method, url).timeout(timeout);
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(BackendError::from_reqwest)?;
    let status = response.status();

    if status == StatusCode::NO_CONTENT {
      return Ok(None);
    }

    let text = response.text().await.map_err(BackendError::from_reqwest)?;

    if !status.is_success() {
      let reason = status.canonical_reason().unwrap_or("Unknown");
      return Err(BackendError::Status {
        status: status.as_u16(),
        message: error_message(status.as_u16(), reason, &text),
      });
    }

    if text.trim().is_empty() {
      return Ok(None);
    }

    serde_json::from_str(&text)
      .map(Some)
      .map_err(|e| BackendError::Decode(e.to_string()))
  }

  async fn send(
    &self,
    retry: &RetryPolicy,
    label: &str,
    method: Method,
    url: Url,
    body: Option<&Fields>,
    timeout: Duration,
  ) -> Result<Option<Value>, BackendError> {
    retry
      .run(label, || self.execute(method.clone(), url.clone(), body, timeout))
      .await
  }
}

/// Parse an authoritative record out of a response body.
fn into_record(body: Option<Value>) -> Result<Option<Record>, BackendError> {
  match body {
    Some(value @ Value::Object(_)) => serde_json::from_value::<Record>(value)
      .map(|r| Some(r.with_provenance(Provenance::Synced)))
      .map_err(|e| BackendError::Decode(e.to_string())),
    _ => Ok(None),
  }
}

#[async_trait]
impl Backend for RestBackend {
  async fn probe(&self) -> Result<(), BackendError> {
    let url = self
      .base
      .join(&format!("api/{}", self.probe_path.trim_start_matches('/')))
      .map_err(|e| BackendError::Network(e.to_string()))?;
    // A probe is its own retry loop; one attempt only
    self
      .execute(Method::GET, url, None, self.probe_timeout)
      .await
      .map(|_| ())
  }

  async fn list(&self, resource: &str, timeout: Duration) -> Result<Vec<Record>, BackendError> {
    let url = self.endpoint(resource, None)?;
    let body = self
      .send(&self.retry, "list", Method::GET, url, None, timeout)
      .await?;

    match body {
      Some(Value::Array(items)) => items
        .into_iter()
        .map(|item| {
          serde_json::from_value::<Record>(item).map_err(|e| BackendError::Decode(e.to_string()))
        })
        .collect(),
      _ => Err(BackendError::Decode(format!(
        "expected an array of {} records",
        resource
      ))),
    }
  }

  async fn create(&self, resource: &str, payload: &Fields) -> Result<Option<Record>, BackendError> {
    let url = self.endpoint(resource, None)?;
    let body = self
      .send(
        &self.create_retry,
        "create",
        Method::POST,
        url,
        Some(payload),
        self.read_timeout,
      )
      .await?;
    into_record(body)
  }

  async fn update(
    &self,
    resource: &str,
    id: i64,
    payload: &Fields,
  ) -> Result<Option<Record>, BackendError> {
    let url = self.endpoint(resource, Some(id))?;
    let method = match self.update_method {
      UpdateMethod::Put => Method::PUT,
      UpdateMethod::Patch => Method::PATCH,
    };
    let body = self
      .send(&self.retry, "update", method, url, Some(payload), self.read_timeout)
      .await?;

    // Some backends answer an update with an empty body
    into_record(body)
  }

  async fn delete(&self, resource: &str, id: i64) -> Result<(), BackendError> {
    let url = self.endpoint(resource, Some(id))?;
    self
      .send(&self.retry, "delete", Method::DELETE, url, None, self.read_timeout)
      .await
      .map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{fields, RecordId};
  use serde_json::json;
  use std::sync::{Arc, Mutex};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  type Reply = Option<(u16, &'static str)>;

  /// Read one request off `stream` and return its request line.
  async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
      let n = stream.read(&mut chunk).await.ok()?;
      if n == 0 {
        return None;
      }
      buf.extend_from_slice(&chunk[..n]);

      let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        continue;
      };
      let head = String::from_utf8_lossy(&buf[..end]).to_string();
      let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
      while buf.len() < end + 4 + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
          break;
        }
        buf.extend_from_slice(&chunk[..n]);
      }
      return head.lines().next().map(String::from);
    }
  }

  /// Local HTTP server answering the n-th request with `reply(n)`. `None`
  /// never answers. Returns the base url and the request lines seen.
  async fn serve<F>(reply: F) -> (String, Arc<Mutex<Vec<String>>>)
  where
    F: Fn(usize) -> Reply + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let reply = Arc::new(reply);

    let seen = requests.clone();
    tokio::spawn(async move {
      while let Ok((mut stream, _)) = listener.accept().await {
        let seen = seen.clone();
        let reply = reply.clone();
        tokio::spawn(async move {
          while let Some(line) = read_request(&mut stream).await {
            let n = {
              let mut seen = seen.lock().unwrap();
              seen.push(line);
              seen.len() - 1
            };
            let Some((status, body)) = reply(n) else {
              tokio::time::sleep(Duration::from_secs(30)).await;
              return;
            };
            let response = format!(
              "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
              status,
              body.len(),
              body
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
              return;
            }
          }
        });
      }
    });

    (url, requests)
  }

  fn backend_with(config: BackendConfig, retry: RetryPolicy) -> RestBackend {
    RestBackend::new(&config, retry).unwrap()
  }

  fn backend(url: &str) -> RestBackend {
    let config = BackendConfig {
      url: url.to_string(),
      ..BackendConfig::default()
    };
    RestBackend::new(&config, RetryPolicy::none()).unwrap()
  }

  #[test]
  fn test_endpoints_keep_trailing_slash() {
    let backend = backend("http://127.0.0.1:8001");
    assert_eq!(
      backend.endpoint("barang", None).unwrap().as_str(),
      "http://127.0.0.1:8001/api/barang/"
    );
    assert_eq!(
      backend.endpoint("barang", Some(7)).unwrap().as_str(),
      "http://127.0.0.1:8001/api/barang/7/"
    );
  }

  #[test]
  fn test_base_path_is_preserved() {
    let backend = backend("https://example.com/inventory");
    assert_eq!(
      backend.endpoint("barang", None).unwrap().as_str(),
      "https://example.com/inventory/api/barang/"
    );
  }

  #[test]
  fn test_into_record_marks_synced() {
    let record = into_record(Some(json!({"id": 11, "nama": "Pen"})))
      .unwrap()
      .unwrap();
    assert_eq!(record.id, RecordId::Server(11));
    assert_eq!(record.provenance, Provenance::Synced);

    assert_eq!(into_record(None).unwrap(), None);
    assert!(into_record(Some(json!({"nama": "no id"}))).is_err());
  }

  #[tokio::test]
  async fn test_unreachable_backend_is_a_network_error() {
    // Port 9 (discard) is closed on test machines
    let backend = backend("http://127.0.0.1:9");
    let err = backend.probe().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.is_ambiguous());
  }

  #[tokio::test]
  async fn test_timed_out_create_is_not_sent_again() {
    let (url, requests) = serve(|_| None).await;
    let config = BackendConfig {
      url,
      read_timeout_secs: 1,
      ..BackendConfig::default()
    };
    let backend = backend_with(config, RetryPolicy::new(3, Duration::ZERO));

    let result = backend
      .create("barang", &fields(json!({"nama": "Pen"})))
      .await;

    assert_eq!(result, Err(BackendError::Timeout));
    assert_eq!(requests.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_create_is_repeated_after_unavailable() {
    let (url, requests) = serve(|n| {
      if n == 0 {
        Some((503, "{}"))
      } else {
        Some((201, r#"{"id": 12, "nama": "Pen"}"#))
      }
    })
    .await;
    let config = BackendConfig {
      url,
      ..BackendConfig::default()
    };
    let backend = backend_with(config, RetryPolicy::new(3, Duration::ZERO));

    let created = backend
      .create("barang", &fields(json!({"nama": "Pen"})))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(created.id, RecordId::Server(12));
    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].starts_with("POST /api/barang/ "));
  }

  #[tokio::test]
  async fn test_update_uses_configured_method() {
    let reply = |_: usize| -> Reply { Some((200, r#"{"id": 7, "nama": "Webcam", "stok": 3}"#)) };

    let (url, requests) = serve(reply).await;
    let patch = backend_with(
      BackendConfig {
        url,
        update_method: UpdateMethod::Patch,
        ..BackendConfig::default()
      },
      RetryPolicy::none(),
    );
    let updated = patch
      .update("barang", 7, &fields(json!({"stok": 3})))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(updated.field_f64("stok"), Some(3.0));
    assert!(requests.lock().unwrap()[0].starts_with("PATCH /api/barang/7/ "));

    let (url, requests) = serve(reply).await;
    let put = backend_with(
      BackendConfig {
        url,
        ..BackendConfig::default()
      },
      RetryPolicy::none(),
    );
    put
      .update("barang", 7, &fields(json!({"stok": 3})))
      .await
      .unwrap();
    assert!(requests.lock().unwrap()[0].starts_with("PUT /api/barang/7/ "));
  }
}
