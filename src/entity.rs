//! Local view of one entity: the cached snapshot with queued writes replayed over it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::Operation;
use crate::store::DurableStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
  pub store_name: String,
  pub entity_id: String,
  /// Server snapshot as last cached
  pub base: Option<Value>,
  /// Snapshot with pending writes applied; `None` if nothing is known or it was deleted
  pub data: Option<Value>,
  pub last_updated: Option<DateTime<Utc>>,
  /// Local writes not yet confirmed by the server
  pub dirty: bool,
  pub deleted: bool,
  pub pending: Vec<Uuid>,
}

/// Build the local view of `entity_id`. A cached body that is not JSON is treated as absent.
pub fn entity_record(
  store: &dyn DurableStore,
  store_name: &str,
  entity_id: &str,
) -> StoreResult<EntityRecord> {
  let cached = store.get(store_name, entity_id)?;
  let last_updated = cached.as_ref().map(|entry| entry.last_updated);
  let base = cached.and_then(|entry| match serde_json::from_slice::<Value>(&entry.payload) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!(store = store_name, entity = entity_id, "Ignoring unreadable snapshot: {}", e);
      None
    }
  });

  let mut data = base.clone();
  let mut deleted = false;
  let mut pending = Vec::new();

  for item in store.pending_for_entity(store_name, entity_id)? {
    pending.push(item.id);
    match item.operation {
      Operation::Delete => {
        data = None;
        deleted = true;
      }
      Operation::Create | Operation::Update => {
        deleted = false;
        data = Some(overlay(data.take(), item.payload));
      }
    }
  }

  Ok(EntityRecord {
    store_name: store_name.to_string(),
    entity_id: entity_id.to_string(),
    base,
    data,
    last_updated,
    dirty: !pending.is_empty(),
    deleted,
    pending,
  })
}

/// Object fields in `changes` replace those in `base`; anything else replaces it whole.
fn overlay(base: Option<Value>, changes: Value) -> Value {
  match (base, changes) {
    (Some(Value::Object(mut fields)), Value::Object(changes)) => {
      fields.extend(changes);
      Value::Object(fields)
    }
    (_, changes) => changes,
  }
}
