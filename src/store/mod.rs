//! Durable local store for cache entries and the mutation queue.
//!
//! All reads and writes of persisted rows go through [`DurableStore`]; each
//! call runs in its own serialized transaction, so callers never hold queue
//! state in memory between invocations.

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::{CacheEntry, QueueStatus, SyncQueueItem};

pub use sqlite::SqliteStore;

/// Size limits for one logical store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreQuota {
  pub max_entries: Option<usize>,
  pub max_bytes: Option<u64>,
}

/// Number of queue items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub in_flight: usize,
  pub synced: usize,
  pub dead_letter: usize,
}

impl QueueCounts {
  /// Items that still need delivery.
  pub fn outstanding(&self) -> usize {
    self.pending + self.in_flight
  }
}

/// Storage backend for cache entries and queued mutations.
pub trait DurableStore: Send + Sync {
  /// Look up a cache entry and mark it most recently used.
  /// Unreadable rows are dropped and reported as absent.
  fn get(&self, store_name: &str, key: &str) -> StoreResult<Option<CacheEntry>>;

  /// Upsert a cache entry. Fails with `QuotaExceeded` if the entry's store
  /// cannot hold it; the caller evicts and retries.
  fn put(&self, entry: &CacheEntry) -> StoreResult<()>;

  /// Evict least-recently-used entries from the entry's store until the entry
  /// fits. Fails with `QuotaExceeded` if it cannot fit even in an empty store.
  fn evict_lru(&self, entry: &CacheEntry) -> StoreResult<usize>;

  /// Remove one cache entry.
  fn invalidate(&self, store_name: &str, key: &str) -> StoreResult<bool>;

  /// Remove every cache entry describing `entity_id`, returning the removed keys.
  fn invalidate_entity(&self, store_name: &str, entity_id: &str) -> StoreResult<Vec<String>>;

  /// Append a mutation to the queue.
  fn enqueue(&self, item: &SyncQueueItem) -> StoreResult<()>;

  /// Claim the oldest deliverable item, marking it in-flight under a lease.
  ///
  /// An item is deliverable when it is pending (or its in-flight lease has
  /// expired), its backoff has elapsed, and no older item for the same entity
  /// is still pending or in flight.
  fn drain_next(&self, store_name: Option<&str>) -> StoreResult<Option<SyncQueueItem>>;

  /// Mark an item returned by `drain_next` delivered.
  ///
  /// Both this and `mark_failed` fail with `ClaimLost`, leaving the row
  /// untouched, once the item's lease expired and another drainer claimed it.
  fn mark_synced(&self, claimed: &SyncQueueItem) -> StoreResult<()>;

  /// Record a failed attempt. Returns the resulting status: `Pending` with a
  /// backoff gate, or `DeadLetter` once the retry budget is spent.
  fn mark_failed(&self, claimed: &SyncQueueItem, error: &str) -> StoreResult<QueueStatus>;

  fn mark_dead_letter(&self, id: Uuid, reason: &str) -> StoreResult<()>;

  /// Move a dead-lettered item back to pending with a fresh retry budget.
  fn retry_dead_letter(&self, id: Uuid) -> StoreResult<bool>;

  /// Replace the base version of pending writes to one entity, after an
  /// earlier write to it was delivered. `None` skips their version check.
  fn rebase_pending(
    &self,
    store_name: &str,
    entity_id: &str,
    base_version: Option<DateTime<Utc>>,
  ) -> StoreResult<usize>;

  /// Clear backoff gates on pending items so they drain immediately.
  fn release_backoff(&self) -> StoreResult<usize>;

  fn queue_item(&self, id: Uuid) -> StoreResult<Option<SyncQueueItem>>;

  fn items_with_status(&self, status: QueueStatus) -> StoreResult<Vec<SyncQueueItem>>;

  /// Non-terminal items for one entity in application order.
  fn pending_for_entity(&self, store_name: &str, entity_id: &str)
    -> StoreResult<Vec<SyncQueueItem>>;

  fn queue_counts(&self) -> StoreResult<QueueCounts>;

  /// Earliest backoff gate among pending items.
  fn next_due_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

  /// Delete synced items.
  fn purge_synced(&self) -> StoreResult<usize>;

  fn register_tag(&self, tag: &str) -> StoreResult<()>;

  fn unregister_tag(&self, tag: &str) -> StoreResult<bool>;

  /// Unregister `tag` only if no pending or in-flight item belongs to
  /// `store_names` (empty means every store). Check and delete are atomic,
  /// so a write queued concurrently keeps its tag.
  fn unregister_tag_if_idle(&self, tag: &str, store_names: &[String]) -> StoreResult<bool>;

  fn registered_tags(&self) -> StoreResult<Vec<String>>;
}
