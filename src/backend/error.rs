//! Backend failures and how they are classified.

use serde_json::Value;

/// A failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
  #[error("Request timeout - server did not respond")]
  Timeout,
  #[error("Network error: {0}")]
  Network(String),
  #[error("{message}")]
  Status { status: u16, message: String },
  #[error("Failed to decode response: {0}")]
  Decode(String),
}

/// Error taxonomy used to decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Timeouts, refused connections
  TransientNetwork,
  /// 5xx, 408, 429, unreadable responses
  ServerSide,
  /// Any other 4xx
  ClientSide,
}

impl BackendError {
  pub fn from_reqwest(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      BackendError::Timeout
    } else if e.is_decode() {
      BackendError::Decode(e.to_string())
    } else {
      BackendError::Network(e.to_string())
    }
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      BackendError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn class(&self) -> ErrorClass {
    match self {
      BackendError::Timeout | BackendError::Network(_) => ErrorClass::TransientNetwork,
      BackendError::Decode(_) => ErrorClass::ServerSide,
      BackendError::Status { status, .. } => match status {
        408 | 429 => ErrorClass::ServerSide,
        400..=499 => ErrorClass::ClientSide,
        _ => ErrorClass::ServerSide,
      },
    }
  }

  /// Whether repeating the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    self.class() != ErrorClass::ClientSide
  }

  /// Whether a call that is not idempotent (a create) may be sent again.
  ///
  /// A timeout or an unreadable reply leaves it unknown whether the backend
  /// already applied the request, so only refused connections and explicit
  /// "try again" statuses qualify.
  pub fn is_resendable(&self) -> bool {
    match self {
      BackendError::Network(_) => true,
      BackendError::Status { status, .. } => matches!(*status, 408 | 429 | 500..=599),
      BackendError::Timeout | BackendError::Decode(_) => false,
    }
  }

  /// The host answered but refused access. It cannot be told apart from a
  /// healthy backend behind an access policy.
  pub fn is_ambiguous(&self) -> bool {
    matches!(self.status(), Some(401) | Some(403))
  }
}

/// Build a human-readable message from an error response body.
///
/// Prefers `detail`, then `error`, then field-keyed validation messages
/// (`field: a, b; other: c`), falling back to `HTTP <status>: <reason>`.
pub fn error_message(status: u16, reason: &str, body: &str) -> String {
  let fallback = format!("HTTP {}: {}", status, reason);

  let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
    return fallback;
  };

  for key in ["detail", "error"] {
    if let Some(message) = map.get(key).and_then(Value::as_str) {
      return message.to_string();
    }
  }

  let field_errors: Vec<String> = map
    .iter()
    .map(|(field, messages)| {
      let text = match messages {
        Value::Array(items) => items
          .iter()
          .map(|m| m.as_str().map(String::from).unwrap_or_else(|| m.to_string()))
          .collect::<Vec<_>>()
          .join(", "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      format!("{}: {}", field, text)
    })
    .collect();

  if field_errors.is_empty() {
    fallback
  } else {
    field_errors.join("; ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn status(code: u16) -> BackendError {
    BackendError::Status {
      status: code,
      message: String::new(),
    }
  }

  #[test]
  fn test_classification() {
    assert_eq!(BackendError::Timeout.class(), ErrorClass::TransientNetwork);
    assert_eq!(
      BackendError::Network("refused".into()).class(),
      ErrorClass::TransientNetwork
    );
    assert_eq!(status(500).class(), ErrorClass::ServerSide);
    assert_eq!(status(503).class(), ErrorClass::ServerSide);
    assert_eq!(status(408).class(), ErrorClass::ServerSide);
    assert_eq!(status(429).class(), ErrorClass::ServerSide);
    assert_eq!(status(400).class(), ErrorClass::ClientSide);
    assert_eq!(status(404).class(), ErrorClass::ClientSide);

    assert!(status(429).is_retryable());
    assert!(!status(422).is_retryable());
    assert!(status(403).is_ambiguous());
    assert!(!status(500).is_ambiguous());
  }

  #[test]
  fn test_only_unsent_or_refused_creates_are_resendable() {
    assert!(BackendError::Network("connection refused".into()).is_resendable());
    assert!(status(503).is_resendable());
    assert!(status(429).is_resendable());
    assert!(!BackendError::Timeout.is_resendable());
    assert!(!BackendError::Decode("eof".into()).is_resendable());
    assert!(!status(400).is_resendable());
  }

  #[test]
  fn test_message_prefers_detail_then_error() {
    assert_eq!(
      error_message(400, "Bad Request", r#"{"detail": "Not allowed", "error": "x"}"#),
      "Not allowed"
    );
    assert_eq!(
      error_message(400, "Bad Request", r#"{"error": "Stock too low"}"#),
      "Stock too low"
    );
  }

  #[test]
  fn test_message_joins_field_errors() {
    let message = error_message(
      400,
      "Bad Request",
      r#"{"nama": ["This field is required.", "Too short."], "stok": "Invalid"}"#,
    );
    assert_eq!(
      message,
      "nama: This field is required., Too short.; stok: Invalid"
    );
  }

  #[test]
  fn test_message_falls_back_to_status_line() {
    assert_eq!(
      error_message(502, "Bad Gateway", "<html>oops</html>"),
      "HTTP 502: Bad Gateway"
    );
    assert_eq!(
      error_message(500, "Internal Server Error", "{}"),
      "HTTP 500: Internal Server Error"
    );
  }
}
