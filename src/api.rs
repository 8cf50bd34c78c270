//! REST layout of the platform API: `{prefix}/{store}[/{entity}]`.

use serde_json::Value;
use std::collections::HashMap;

use crate::model::Operation;

/// Cache `entity_ref` used for collection listings, invalidated by any write to the store.
pub const COLLECTION_REF: &str = "*";

/// Store and entity addressed by an API path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
  pub store_name: String,
  pub entity_id: Option<String>,
}

/// Maps stores and entities to API paths and back.
#[derive(Debug, Clone)]
pub struct ApiLayout {
  prefix: String,
  key_fields: HashMap<String, String>,
  version_fields: HashMap<String, String>,
}

impl ApiLayout {
  pub fn new(prefix: &str) -> Self {
    Self {
      prefix: format!("/{}", prefix.trim_matches('/')),
      key_fields: HashMap::new(),
      version_fields: HashMap::new(),
    }
  }

  /// Payload field holding the entity id for `store_name` (default `id`).
  pub fn with_key_field(mut self, store_name: &str, field: &str) -> Self {
    self
      .key_fields
      .insert(store_name.to_string(), field.to_string());
    self
  }

  /// Response field holding the server's last-modified time (default `updated_at`).
  pub fn with_version_field(mut self, store_name: &str, field: &str) -> Self {
    self
      .version_fields
      .insert(store_name.to_string(), field.to_string());
    self
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn is_api_path(&self, path: &str) -> bool {
    path == self.prefix || path.starts_with(&format!("{}/", self.prefix))
  }

  pub fn key_field(&self, store_name: &str) -> &str {
    self
      .key_fields
      .get(store_name)
      .map(String::as_str)
      .unwrap_or("id")
  }

  pub fn version_field(&self, store_name: &str) -> &str {
    self
      .version_fields
      .get(store_name)
      .map(String::as_str)
      .unwrap_or("updated_at")
  }

  /// Entity id carried in a payload, if any. Numeric ids are stringified.
  pub fn entity_id_in(&self, store_name: &str, payload: &Value) -> Option<String> {
    match payload.get(self.key_field(store_name))? {
      Value::String(s) if !s.is_empty() => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  pub fn collection_path(&self, store_name: &str) -> String {
    format!("{}/{}", self.prefix, store_name)
  }

  pub fn entity_path(&self, store_name: &str, entity_id: &str) -> String {
    format!(
      "{}/{}/{}",
      self.prefix,
      store_name,
      urlencoding_segment(entity_id)
    )
  }

  /// Path a queued write is delivered to.
  pub fn write_path(&self, operation: Operation, store_name: &str, entity_id: &str) -> String {
    match operation {
      Operation::Create => self.collection_path(store_name),
      Operation::Update | Operation::Delete => self.entity_path(store_name, entity_id),
    }
  }

  /// Parse `{prefix}/{store}[/{entity}]`. Deeper paths are not addressable.
  pub fn parse(&self, path: &str) -> Option<ApiTarget> {
    let path = path.split('?').next().unwrap_or(path);
    let rest = path.strip_prefix(&self.prefix)?.strip_prefix('/')?;
    let mut segments = rest.split('/').filter(|s| !s.is_empty());

    let store_name = segments.next()?.to_string();
    let entity_id = segments.next().map(decode_segment);
    if segments.next().is_some() {
      return None;
    }

    Some(ApiTarget {
      store_name,
      entity_id,
    })
  }
}

fn urlencoding_segment(segment: &str) -> String {
  url::form_urlencoded::byte_serialize(segment.as_bytes())
    .collect::<String>()
    .replace('+', "%20")
}

fn decode_segment(segment: &str) -> String {
  url::form_urlencoded::parse(format!("k={}", segment).as_bytes())
    .next()
    .map(|(_, v)| v.into_owned())
    .unwrap_or_else(|| segment.to_string())
}
