use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ConnectivityMonitor, SyncTags};
use crate::clock::{Clock, SystemClock};
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{StoreError, StoreResult};
use crate::model::{QueueStatus, SyncQueueItem};
use crate::notify::{MessageType, NotificationBus};
use crate::queue::{Delivery, MutationEngine};
use crate::store::DurableStore;

/// Counts from one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
  pub tag: String,
  pub synced: usize,
  /// Failed attempts put back with a backoff gate
  pub retried: usize,
  pub dead_lettered: usize,
  /// Conflicts the comparator declined to resolve
  pub conflicts: usize,
  /// Writes dropped because the server's newer state won
  pub superseded: usize,
}

impl CycleReport {
  fn new(tag: &str) -> Self {
    Self {
      tag: tag.to_string(),
      ..Default::default()
    }
  }

  fn record(&mut self, outcome: ItemOutcome) {
    match outcome {
      ItemOutcome::Synced => self.synced += 1,
      ItemOutcome::Retried => self.retried += 1,
      ItemOutcome::DeadLettered => self.dead_lettered += 1,
      ItemOutcome::Conflict => self.conflicts += 1,
      ItemOutcome::Superseded => self.superseded += 1,
      ItemOutcome::Reclaimed => {}
    }
  }

  /// Whether anything in the cycle failed to reach the server.
  pub fn has_failures(&self) -> bool {
    self.retried + self.dead_lettered + self.conflicts > 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
  Synced,
  Retried,
  DeadLettered,
  Conflict,
  Superseded,
  /// Another drainer took over the item after its lease expired
  Reclaimed,
}

/// Drains the mutation queue when a sync tag fires.
///
/// Nothing about queue items is kept between calls: every cycle claims items
/// from the store, and the store's in-flight lease keeps two overlapping
/// cycles from delivering the same item.
pub struct SyncCoordinator {
  store: Arc<dyn DurableStore>,
  engine: Arc<MutationEngine>,
  resolver: ConflictResolver,
  bus: NotificationBus,
  tags: SyncTags,
  clock: Arc<dyn Clock>,
  concurrency: usize,
  limit: Arc<Semaphore>,
}

impl SyncCoordinator {
  pub fn new(
    store: Arc<dyn DurableStore>,
    engine: Arc<MutationEngine>,
    resolver: ConflictResolver,
    bus: NotificationBus,
    tags: SyncTags,
  ) -> Self {
    Self {
      store,
      engine,
      resolver,
      bus,
      tags,
      clock: Arc::new(SystemClock),
      concurrency: 3,
      limit: Arc::new(Semaphore::new(3)),
    }
  }

  /// Network calls allowed at once, across all cycles.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    let concurrency = concurrency.max(1);
    self.concurrency = concurrency;
    self.limit = Arc::new(Semaphore::new(concurrency));
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn register(&self, tag: &str) -> StoreResult<()> {
    self.store.register_tag(tag)
  }

  pub fn unregister(&self, tag: &str) -> StoreResult<bool> {
    self.store.unregister_tag(tag)
  }

  pub fn registered_tags(&self) -> StoreResult<Vec<String>> {
    self.store.registered_tags()
  }

  /// Put a dead-lettered write back in the queue and register the tag that
  /// drains its store, so the next `fire_all` picks it up.
  pub fn retry_dead_letter(&self, id: Uuid) -> StoreResult<bool> {
    if !self.store.retry_dead_letter(id)? {
      return Ok(false);
    }
    if let Some(item) = self.store.queue_item(id)? {
      let tag = self.tags.tag_for_store(&item.store_name);
      self.store.register_tag(tag)?;
      info!(%id, tag, "Dead-lettered write requeued");
    }
    Ok(true)
  }

  /// Fire one tag: drain its stores until nothing is deliverable right now.
  pub async fn run_cycle(&self, tag: &str) -> StoreResult<CycleReport> {
    info!(tag, "Sync cycle starting");
    self
      .bus
      .publish(MessageType::SyncStart, Some(json!({ "tag": tag })));

    match self.drain(tag).await {
      Ok(report) => {
        info!(
          tag,
          synced = report.synced,
          retried = report.retried,
          dead_lettered = report.dead_lettered,
          conflicts = report.conflicts,
          superseded = report.superseded,
          "Sync cycle finished"
        );
        let kind = if report.has_failures() {
          MessageType::SyncError
        } else {
          MessageType::SyncComplete
        };
        self.bus.publish(kind, serde_json::to_value(&report).ok());

        let scope: Vec<String> = self.tags.stores_for_tag(tag).into_iter().flatten().collect();
        if self.store.unregister_tag_if_idle(tag, &scope)? {
          debug!(tag, "Nothing outstanding, tag unregistered");
        }
        Ok(report)
      }
      Err(e) => {
        error!(tag, "Sync cycle aborted: {}", e);
        self.bus.publish(
          MessageType::SyncError,
          Some(json!({ "tag": tag, "error": e.to_string() })),
        );
        Err(e)
      }
    }
  }

  /// Fire every registered tag concurrently.
  pub async fn fire_all(&self) -> StoreResult<Vec<CycleReport>> {
    let tags = self.store.registered_tags()?;
    let results = futures::future::join_all(tags.iter().map(|tag| self.run_cycle(tag))).await;
    results.into_iter().collect()
  }

  /// Probe connectivity until `shutdown` flips, firing every registered tag
  /// when the origin comes back and whenever a backoff gate elapses.
  pub async fn watch(
    &self,
    monitor: &ConnectivityMonitor,
    mut shutdown: watch::Receiver<bool>,
  ) -> StoreResult<()> {
    let mut ticker = tokio::time::interval(monitor.interval());
    let mut online = false;

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = shutdown.changed() => break,
      }
      if *shutdown.borrow() {
        break;
      }

      let reachable = monitor.probe().await;
      if reachable && !online {
        let released = self.store.release_backoff()?;
        info!(released, "Connectivity restored, firing sync");
        self.fire_all().await?;
      } else if reachable {
        let due = self.store.next_due_at()?;
        if due.is_some_and(|due| due <= self.clock.now()) {
          debug!("Backoff elapsed, firing sync");
          self.fire_all().await?;
        }
      } else if online {
        warn!("Connectivity lost");
      }
      online = reachable;
    }

    Ok(())
  }

  async fn drain(&self, tag: &str) -> StoreResult<CycleReport> {
    let scopes = self.tags.stores_for_tag(tag);
    let mut report = CycleReport::new(tag);
    let mut in_flight = FuturesUnordered::new();
    let mut cursor = 0;
    // Consecutive scopes that had nothing deliverable
    let mut idle = 0;

    loop {
      while in_flight.len() < self.concurrency && idle < scopes.len() {
        let scope = scopes[cursor % scopes.len()].as_deref();
        cursor += 1;
        match self.store.drain_next(scope)? {
          Some(item) => {
            idle = 0;
            in_flight.push(self.process(item));
          }
          None => idle += 1,
        }
      }

      match in_flight.next().await {
        Some(outcome) => {
          report.record(outcome?);
          // A finished item may unblock the next write to its entity
          idle = 0;
        }
        None => break,
      }
    }

    Ok(report)
  }

  async fn process(&self, mut item: SyncQueueItem) -> StoreResult<ItemOutcome> {
    // Never closed, so acquiring cannot fail
    let _permit = self.limit.acquire().await.ok();
    debug!(id = %item.id, store = %item.store_name, entity = %item.entity_id, "Delivering");

    if ConflictResolver::needs_check(&item) && item.base_version.is_some() {
      let remote = match self.engine.fetch_remote(&item).await {
        Ok(remote) => remote,
        Err(reason) => return self.retry_later(&item, &reason),
      };

      match self.resolver.decide(&item, remote.as_ref()) {
        Resolution::ApplyLocal => {}
        Resolution::Merged(payload) => item.payload = payload,
        Resolution::AlreadyApplied => return self.finish(&item),
        Resolution::KeepRemote => {
          if self.finish(&item)? == ItemOutcome::Reclaimed {
            return Ok(ItemOutcome::Reclaimed);
          }
          warn!(id = %item.id, entity = %item.entity_id, "Server has newer state, dropping write");
          self.bus.publish(
            MessageType::SyncConflict,
            Some(json!({
              "id": item.id,
              "store": item.store_name,
              "entityId": item.entity_id,
              "resolution": "keep-remote",
            })),
          );
          return Ok(ItemOutcome::Superseded);
        }
        Resolution::Declined(reason) => {
          warn!(id = %item.id, entity = %item.entity_id, %reason, "Conflict needs the user");
          self.store.mark_dead_letter(item.id, &reason)?;
          self.bus.publish(
            MessageType::SyncConflict,
            Some(json!({
              "id": item.id,
              "store": item.store_name,
              "entityId": item.entity_id,
              "resolution": "declined",
              "reason": reason,
            })),
          );
          self.publish_dead_letter(&item, &reason);
          return Ok(ItemOutcome::Conflict);
        }
      }
    }

    match self.engine.deliver(&item).await {
      Delivery::Delivered(response) => {
        let outcome = self.finish(&item)?;
        if outcome == ItemOutcome::Synced {
          // Later writes to the entity were made on top of this one
          let version = self.engine.delivered_version(&item, &response);
          self
            .store
            .rebase_pending(&item.store_name, &item.entity_id, version)?;
        }
        Ok(outcome)
      }
      Delivery::Transient(reason) => self.retry_later(&item, &reason),
      Delivery::Rejected(response) => {
        let reason = format!("rejected with HTTP {}", response.status);
        error!(id = %item.id, entity = %item.entity_id, %reason, "Write dead-lettered");
        self.store.mark_dead_letter(item.id, &reason)?;
        self.publish_dead_letter(&item, &reason);
        Ok(ItemOutcome::DeadLettered)
      }
    }
  }

  fn finish(&self, item: &SyncQueueItem) -> StoreResult<ItemOutcome> {
    match self.store.mark_synced(item) {
      Ok(()) => {}
      Err(StoreError::ClaimLost(_)) => return Ok(self.reclaimed(item)),
      Err(e) => return Err(e),
    }
    self.engine.invalidate_related(item)?;
    Ok(ItemOutcome::Synced)
  }

  fn retry_later(&self, item: &SyncQueueItem, reason: &str) -> StoreResult<ItemOutcome> {
    let status = match self.store.mark_failed(item, reason) {
      Ok(status) => status,
      Err(StoreError::ClaimLost(_)) => return Ok(self.reclaimed(item)),
      Err(e) => return Err(e),
    };
    match status {
      QueueStatus::DeadLetter => {
        error!(id = %item.id, entity = %item.entity_id, reason, "Retries exhausted, write dead-lettered");
        self.publish_dead_letter(item, reason);
        Ok(ItemOutcome::DeadLettered)
      }
      _ => {
        warn!(id = %item.id, entity = %item.entity_id, reason, "Delivery failed, will retry");
        Ok(ItemOutcome::Retried)
      }
    }
  }

  fn reclaimed(&self, item: &SyncQueueItem) -> ItemOutcome {
    warn!(id = %item.id, entity = %item.entity_id, "Lease expired mid-attempt, leaving the write to its new owner");
    ItemOutcome::Reclaimed
  }

  fn publish_dead_letter(&self, item: &SyncQueueItem, reason: &str) {
    self.bus.publish(
      MessageType::DeadLetter,
      Some(json!({
        "id": item.id,
        "store": item.store_name,
        "entityId": item.entity_id,
        "operation": item.operation,
        "error": reason,
      })),
    );
  }
}
