//! Persisted records: cache entries and queued mutations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A cached response body or entity snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Logical partition (e.g. "students", "pages")
  pub store_name: String,
  /// Route or entity identifier, unique within the store
  pub key: String,
  /// Opaque body bytes
  pub payload: Vec<u8>,
  /// Content type of the body, when it came from an HTTP response
  pub content_type: Option<String>,
  /// Entity this entry describes, used for invalidation after writes
  pub entity_ref: Option<String>,
  /// When the entry was written
  pub last_updated: DateTime<Utc>,
  /// Maximum age before the entry must be revalidated
  pub ttl: Option<Duration>,
}

impl CacheEntry {
  pub fn new(
    store_name: impl Into<String>,
    key: impl Into<String>,
    payload: Vec<u8>,
    last_updated: DateTime<Utc>,
  ) -> Self {
    Self {
      store_name: store_name.into(),
      key: key.into(),
      payload,
      content_type: None,
      entity_ref: None,
      last_updated,
      ttl: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
    self.content_type = content_type;
    self
  }

  pub fn with_entity_ref(mut self, entity_ref: Option<String>) -> Self {
    self.entity_ref = entity_ref;
    self
  }

  /// Whether the entry is past its TTL at `now`. Entries without a TTL never expire.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    match self.ttl {
      Some(ttl) => now - self.last_updated > ttl,
      None => false,
    }
  }

  /// Bytes counted against the store quota.
  pub fn size(&self) -> u64 {
    (self.key.len() + self.payload.len()) as u64
  }
}

/// Kind of write carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown operation '{}'", other)),
    }
  }
}

/// Lifecycle state of a queue item.
///
/// `pending -> in-flight -> {synced | pending (retry) | dead-letter}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
  Pending,
  InFlight,
  Synced,
  DeadLetter,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Synced => "synced",
      Self::DeadLetter => "dead-letter",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Synced | Self::DeadLetter)
  }
}

impl fmt::Display for QueueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueueStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "synced" => Ok(Self::Synced),
      "dead-letter" => Ok(Self::DeadLetter),
      other => Err(format!("unknown queue status '{}'", other)),
    }
  }
}

/// A write that has not been confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
  /// Locally generated id, sent as the idempotency key on every attempt
  pub id: Uuid,
  pub operation: Operation,
  pub store_name: String,
  /// Entity the write targets; writes to one entity apply in `created_at` order
  pub entity_id: String,
  pub payload: Value,
  /// `last_updated` of the local entity view when the write was made
  pub base_version: Option<DateTime<Utc>>,
  /// Failed delivery attempts so far
  pub attempts: u32,
  pub last_attempt: Option<DateTime<Utc>>,
  /// Earliest time the item may be drained again
  pub next_attempt_at: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
  pub status: QueueStatus,
  pub last_error: Option<String>,
}

impl SyncQueueItem {
  /// Create a pending item. A missing entity id is replaced by the item id,
  /// so the write orders only against itself.
  pub fn new(
    operation: Operation,
    store_name: impl Into<String>,
    entity_id: Option<String>,
    payload: Value,
    created_at: DateTime<Utc>,
  ) -> Self {
    let id = Uuid::new_v4();
    Self {
      id,
      operation,
      store_name: store_name.into(),
      entity_id: entity_id.unwrap_or_else(|| id.to_string()),
      payload,
      base_version: None,
      attempts: 0,
      last_attempt: None,
      next_attempt_at: created_at,
      created_at,
      status: QueueStatus::Pending,
      last_error: None,
    }
  }

  pub fn with_base_version(mut self, base_version: Option<DateTime<Utc>>) -> Self {
    self.base_version = base_version;
    self
  }

  pub fn idempotency_key(&self) -> String {
    self.id.to_string()
  }
}
