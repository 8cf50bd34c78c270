//! Conflict resolution between queued writes and the server's current state.
//!
//! A queued `update`/`delete` remembers the version of the entity it was
//! based on. If the server still holds that version the write applies as-is;
//! otherwise the store's [`Comparator`] decides. The core never interprets
//! domain data itself.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{Operation, SyncQueueItem};

/// Server-side state of an entity at drain time.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVersion {
  pub updated_at: Option<DateTime<Utc>>,
  pub payload: Value,
}

impl RemoteVersion {
  /// Parse a response body, reading the version from `version_field`.
  /// Accepts RFC 3339 strings or epoch milliseconds.
  pub fn from_body(body: &[u8], version_field: &str) -> Option<Self> {
    let payload: Value = serde_json::from_slice(body).ok()?;
    let updated_at = match payload.get(version_field) {
      Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc)),
      Some(Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
      _ => None,
    };
    Some(Self {
      updated_at,
      payload,
    })
  }
}

/// What to do with a queued write.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// Send the write unchanged
  ApplyLocal,
  /// Send this payload instead
  Merged(Value),
  /// The server's state wins; the write is dropped
  KeepRemote,
  /// The write already has no effect (e.g. deleting an entity that is gone)
  AlreadyApplied,
  /// The comparator cannot decide; the user must
  Declined(String),
}

/// Decides between a local write and a changed server entity.
pub trait Comparator: Send + Sync {
  fn resolve(&self, local: &SyncQueueItem, remote: &RemoteVersion) -> Resolution;
}

/// Newest timestamp wins: the write's creation time against the server's
/// last modification. Ties go to the local write.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl Comparator for LastWriteWins {
  fn resolve(&self, local: &SyncQueueItem, remote: &RemoteVersion) -> Resolution {
    match remote.updated_at {
      Some(remote_at) if remote_at > local.created_at => Resolution::KeepRemote,
      _ => Resolution::ApplyLocal,
    }
  }
}

/// Field-level merge for object payloads: fields the local write touches
/// override the server's, everything else keeps the server's value.
/// Deletes fall back to last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl Comparator for FieldMerge {
  fn resolve(&self, local: &SyncQueueItem, remote: &RemoteVersion) -> Resolution {
    match (local.operation, &local.payload, &remote.payload) {
      (Operation::Update, Value::Object(changes), Value::Object(server)) => {
        let mut merged = server.clone();
        for (field, value) in changes {
          merged.insert(field.clone(), value.clone());
        }
        Resolution::Merged(Value::Object(merged))
      }
      _ => LastWriteWins.resolve(local, remote),
    }
  }
}

/// Never resolves automatically; every conflict goes to the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl Comparator for Manual {
  fn resolve(&self, _local: &SyncQueueItem, remote: &RemoteVersion) -> Resolution {
    let at = remote
      .updated_at
      .map(|t| t.to_rfc3339())
      .unwrap_or_else(|| "unknown time".to_string());
    Resolution::Declined(format!("entity changed on server at {}", at))
  }
}

/// Comparator choice per store, as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
  #[default]
  LastWriteWins,
  FieldMerge,
  Manual,
}

impl ConflictPolicy {
  pub fn comparator(&self) -> Arc<dyn Comparator> {
    match self {
      Self::LastWriteWins => Arc::new(LastWriteWins),
      Self::FieldMerge => Arc::new(FieldMerge),
      Self::Manual => Arc::new(Manual),
    }
  }
}

/// Routes each queued write to its store's comparator.
#[derive(Clone)]
pub struct ConflictResolver {
  default: Arc<dyn Comparator>,
  per_store: HashMap<String, Arc<dyn Comparator>>,
}

impl Default for ConflictResolver {
  fn default() -> Self {
    Self::new()
  }
}

impl ConflictResolver {
  pub fn new() -> Self {
    Self {
      default: Arc::new(LastWriteWins),
      per_store: HashMap::new(),
    }
  }

  /// Install a comparator for one store.
  pub fn register(&mut self, store_name: &str, comparator: Arc<dyn Comparator>) {
    self.per_store.insert(store_name.to_string(), comparator);
  }

  /// Whether the write must be checked against the server before sending.
  pub fn needs_check(item: &SyncQueueItem) -> bool {
    matches!(item.operation, Operation::Update | Operation::Delete)
  }

  /// Decide how `item` applies given the server's version (`None` = entity not found).
  pub fn decide(&self, item: &SyncQueueItem, remote: Option<&RemoteVersion>) -> Resolution {
    if !Self::needs_check(item) {
      return Resolution::ApplyLocal;
    }

    let remote = match remote {
      Some(remote) => remote,
      None if item.operation == Operation::Delete => return Resolution::AlreadyApplied,
      None => return Resolution::ApplyLocal,
    };

    let unchanged = match (item.base_version, remote.updated_at) {
      (_, None) => true,
      (Some(base), Some(remote_at)) => remote_at <= base,
      (None, Some(_)) => false,
    };
    if unchanged {
      return Resolution::ApplyLocal;
    }

    self
      .per_store
      .get(&item.store_name)
      .unwrap_or(&self.default)
      .resolve(item, remote)
  }
}
