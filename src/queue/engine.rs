//! Mutation engine: try the write now, queue it durably if the network says no.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiLayout, COLLECTION_REF};
use crate::clock::{Clock, SystemClock};
use crate::conflict::RemoteVersion;
use crate::error::StoreResult;
use crate::model::{Operation, SyncQueueItem};
use crate::notify::{MessageType, NotificationBus};
use crate::store::DurableStore;
use crate::sync::SyncTags;
use crate::transport::{send_with_timeout, Request, Response, Transport};

/// Result of submitting a write from a page.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// The server accepted the write
  Synced(Response),
  /// The write is durably queued and will be replayed by background sync
  Queued { id: Uuid },
  /// The server refused the write; retrying would not help
  Rejected(Response),
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
  Delivered(Response),
  /// Network failure, timeout, or a retryable status
  Transient(String),
  Rejected(Response),
}

/// Submits writes and replays queued ones.
pub struct MutationEngine {
  store: Arc<dyn DurableStore>,
  transport: Arc<dyn Transport>,
  bus: NotificationBus,
  clock: Arc<dyn Clock>,
  layout: ApiLayout,
  tags: SyncTags,
  timeout: Duration,
}

impl MutationEngine {
  pub fn new(
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    bus: NotificationBus,
    layout: ApiLayout,
  ) -> Self {
    Self {
      store,
      transport,
      bus,
      clock: Arc::new(SystemClock),
      layout,
      tags: SyncTags::default(),
      timeout: Duration::from_secs(10),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_tags(mut self, tags: SyncTags) -> Self {
    self.tags = tags;
    self
  }

  /// Bound for each network attempt.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn layout(&self) -> &ApiLayout {
    &self.layout
  }

  /// Submit a write, taking the entity id from the store's key field in `payload`.
  pub async fn submit(
    &self,
    operation: Operation,
    store_name: &str,
    payload: Value,
  ) -> StoreResult<SubmitOutcome> {
    let entity_id = self.layout.entity_id_in(store_name, &payload);
    self
      .submit_for(operation, store_name, entity_id, payload)
      .await
  }

  /// Submit a write for an explicit entity.
  pub async fn submit_for(
    &self,
    operation: Operation,
    store_name: &str,
    entity_id: Option<String>,
    payload: Value,
  ) -> StoreResult<SubmitOutcome> {
    let base_version = match &entity_id {
      Some(id) => self.store.get(store_name, id)?.map(|entry| entry.last_updated),
      None => None,
    };
    let item = SyncQueueItem::new(operation, store_name, entity_id, payload, self.clock.now())
      .with_base_version(base_version);

    // Writes behind queued writes to the same entity wait their turn
    if !self
      .store
      .pending_for_entity(store_name, &item.entity_id)?
      .is_empty()
    {
      debug!(store = store_name, entity = %item.entity_id, "Earlier writes pending, queuing");
      return self.queue(item, "earlier writes to this entity are pending");
    }

    match self.deliver(&item).await {
      Delivery::Delivered(response) => {
        self.invalidate_related(&item)?;
        Ok(SubmitOutcome::Synced(response))
      }
      Delivery::Transient(reason) => self.queue(item, &reason),
      Delivery::Rejected(response) => {
        warn!(
          store = store_name,
          entity = %item.entity_id,
          status = response.status,
          "Server rejected write"
        );
        Ok(SubmitOutcome::Rejected(response))
      }
    }
  }

  fn queue(&self, mut item: SyncQueueItem, reason: &str) -> StoreResult<SubmitOutcome> {
    item.last_error = Some(reason.to_string());
    self.store.enqueue(&item)?;

    let tag = self.tags.tag_for_store(&item.store_name);
    self.store.register_tag(tag)?;

    info!(
      id = %item.id,
      store = %item.store_name,
      entity = %item.entity_id,
      reason,
      "Write queued for background sync"
    );
    self.bus.publish(
      MessageType::MutationQueued,
      Some(json!({
        "id": item.id,
        "store": item.store_name,
        "entityId": item.entity_id,
        "operation": item.operation,
        "tag": tag,
      })),
    );

    Ok(SubmitOutcome::Queued { id: item.id })
  }

  /// One delivery attempt, carrying the item's idempotency key.
  pub async fn deliver(&self, item: &SyncQueueItem) -> Delivery {
    let request = self.build_request(item);

    match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
      Ok(response) if response.is_success() => Delivery::Delivered(response),
      // Already gone is what a delete wants
      Ok(response) if item.operation == Operation::Delete && response.status == 404 => {
        Delivery::Delivered(response)
      }
      Ok(response) if response.is_transient_failure() => {
        Delivery::Transient(format!("HTTP {}", response.status))
      }
      Ok(response) => Delivery::Rejected(response),
      Err(e) => Delivery::Transient(e.to_string()),
    }
  }

  /// The request a queue item is delivered as.
  pub fn build_request(&self, item: &SyncQueueItem) -> Request {
    let method = match item.operation {
      Operation::Create => Method::POST,
      Operation::Update => Method::PUT,
      Operation::Delete => Method::DELETE,
    };
    let path = self
      .layout
      .write_path(item.operation, &item.store_name, &item.entity_id);

    let request =
      Request::new(method, path).with_header("Idempotency-Key", item.idempotency_key());

    match item.operation {
      Operation::Delete => request,
      Operation::Create | Operation::Update => request
        .with_header("Content-Type", "application/json")
        .with_body(item.payload.to_string().into_bytes()),
    }
  }

  /// Current server version of the item's entity; `Ok(None)` if it does not exist.
  /// `Err` means the server could not be asked and the attempt should be retried.
  pub async fn fetch_remote(&self, item: &SyncQueueItem) -> Result<Option<RemoteVersion>, String> {
    let request = Request::get(self.layout.entity_path(&item.store_name, &item.entity_id))
      .with_header("Accept", "application/json");

    match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
      Ok(response) if matches!(response.status, 404 | 410) => Ok(None),
      Ok(response) if response.is_transient_failure() => {
        Err(format!("version check failed: HTTP {}", response.status))
      }
      Ok(response) => {
        let version_field = self.layout.version_field(&item.store_name);
        let unknown = RemoteVersion {
          updated_at: None,
          payload: Value::Null,
        };
        if !response.is_success() {
          return Ok(Some(unknown));
        }
        Ok(Some(
          RemoteVersion::from_body(&response.body, version_field).unwrap_or(unknown),
        ))
      }
      Err(e) => Err(format!("version check failed: {}", e)),
    }
  }

  /// Server version a write's response reports, if it carries one.
  pub fn delivered_version(&self, item: &SyncQueueItem, response: &Response) -> Option<DateTime<Utc>> {
    RemoteVersion::from_body(&response.body, self.layout.version_field(&item.store_name))
      .and_then(|remote| remote.updated_at)
  }

  /// Drop cached data the write made stale: the entity's entries and its store's listings.
  pub fn invalidate_related(&self, item: &SyncQueueItem) -> StoreResult<Vec<String>> {
    let mut keys = self
      .store
      .invalidate_entity(&item.store_name, &item.entity_id)?;
    keys.extend(
      self
        .store
        .invalidate_entity(&item.store_name, COLLECTION_REF)?,
    );

    if !keys.is_empty() {
      self.bus.publish(
        MessageType::CacheInvalidated,
        Some(json!({
          "store": item.store_name,
          "entityId": item.entity_id,
          "keys": keys,
        })),
      );
    }

    Ok(keys)
  }
}
