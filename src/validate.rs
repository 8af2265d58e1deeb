//! Synchronous payload validation, applied before any optimistic change.

use serde_json::{Number, Value};

use crate::record::Fields;

/// Validates and normalizes mutation payloads for one resource.
pub trait Validator: Send + Sync {
  /// Validate a full payload for a new record.
  fn validate_create(&self, payload: Fields) -> Result<Fields, String>;

  /// Validate a (possibly partial) payload for an existing record.
  fn validate_update(&self, payload: Fields) -> Result<Fields, String>;
}

/// Accepts anything. Used for resources without inventory rules.
pub struct Unvalidated;

impl Validator for Unvalidated {
  fn validate_create(&self, payload: Fields) -> Result<Fields, String> {
    Ok(payload)
  }

  fn validate_update(&self, payload: Fields) -> Result<Fields, String> {
    Ok(payload)
  }
}

/// Rules for inventory items (`barang`).
pub struct ItemValidator;

const DEFAULT_MINIMUM: i64 = 5;

impl Validator for ItemValidator {
  fn validate_create(&self, mut payload: Fields) -> Result<Fields, String> {
    if !payload.contains_key("nama") {
      return Err("nama is required".to_string());
    }
    if !payload.contains_key("stok") {
      return Err("stok is required".to_string());
    }
    payload
      .entry("minimum")
      .or_insert_with(|| Value::from(DEFAULT_MINIMUM));
    payload.entry("harga").or_insert_with(|| Value::from(0));

    self.validate_update(payload)
  }

  fn validate_update(&self, mut payload: Fields) -> Result<Fields, String> {
    payload.remove("id");

    if let Some(nama) = payload.get("nama") {
      let nama = sanitize(nama.as_str().unwrap_or_default());
      if nama.is_empty() {
        return Err("nama is required".to_string());
      }
      payload.insert("nama".to_string(), Value::String(nama));
    }

    for field in ["stok", "minimum", "harga"] {
      if let Some(value) = payload.get(field) {
        let number = non_negative(value)
          .ok_or_else(|| format!("{} must be a non-negative number", field))?;
        payload.insert(field.to_string(), number);
      }
    }

    Ok(payload)
  }
}

/// Pick the validator for a resource name.
pub fn validator_for(resource: &str) -> Box<dyn Validator> {
  match resource {
    "barang" | "items" => Box::new(ItemValidator),
    _ => Box::new(Unvalidated),
  }
}

/// Strip angle brackets and surrounding whitespace.
fn sanitize(input: &str) -> String {
  input.replace(['<', '>'], "").trim().to_string()
}

/// Accept numbers and numeric strings that are >= 0.
fn non_negative(value: &Value) -> Option<Value> {
  let number = match value {
    Value::Number(n) => n.clone(),
    Value::String(s) => {
      let s = s.trim();
      match s.parse::<i64>() {
        Ok(i) => Number::from(i),
        Err(_) => Number::from_f64(s.parse::<f64>().ok()?)?,
      }
    }
    _ => return None,
  };

  if number.as_f64()? < 0.0 {
    return None;
  }
  Some(Value::Number(number))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::fields;
  use serde_json::json;

  #[test]
  fn test_create_fills_defaults() {
    let payload = ItemValidator
      .validate_create(fields(json!({"nama": " Pen ", "stok": 10})))
      .unwrap();

    assert_eq!(payload["nama"], json!("Pen"));
    assert_eq!(payload["minimum"], json!(5));
    assert_eq!(payload["harga"], json!(0));
  }

  #[test]
  fn test_create_rejects_negative_stock() {
    let err = ItemValidator
      .validate_create(fields(json!({"nama": "Pen", "stok": -1})))
      .unwrap_err();
    assert_eq!(err, "stok must be a non-negative number");
  }

  #[test]
  fn test_create_requires_name() {
    let err = ItemValidator
      .validate_create(fields(json!({"nama": "<>", "stok": 1})))
      .unwrap_err();
    assert_eq!(err, "nama is required");

    assert!(ItemValidator
      .validate_create(fields(json!({"stok": 1})))
      .is_err());
  }

  #[test]
  fn test_update_accepts_partial_payload_and_numeric_strings() {
    let payload = ItemValidator
      .validate_update(fields(json!({"stok": "3"})))
      .unwrap();
    assert_eq!(payload, fields(json!({"stok": 3})));
  }

  #[test]
  fn test_unvalidated_passes_through() {
    let payload = fields(json!({"anything": -1}));
    assert_eq!(Unvalidated.validate_create(payload.clone()).unwrap(), payload);
  }
}
