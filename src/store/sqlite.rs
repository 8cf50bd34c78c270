//! SQLite implementation of the durable store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::schema::MIGRATIONS;
use super::{DurableStore, QueueCounts, StoreQuota};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::model::{CacheEntry, QueueStatus, SyncQueueItem};
use crate::queue::RetryPolicy;

/// Columns selected for every queue row; `rowid` comes first so unreadable
/// rows can still be addressed.
const QUEUE_COLUMNS: &str = "rowid, id, operation, store_name, entity_id, payload, base_version, \
   attempts, last_attempt, next_attempt_at, created_at, status, last_error";

/// SQLite-backed durable store.
///
/// The connection is guarded by a mutex for in-process callers, and every
/// operation opens a `BEGIN IMMEDIATE` transaction so separate processes
/// sharing the database file are serialized as well.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
  retry: RetryPolicy,
  lease: Duration,
  quotas: HashMap<String, StoreQuota>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("lxp-sync").join("sync.db"))
  }

  fn from_connection(conn: Connection) -> StoreResult<Self> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    let store = Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
      retry: RetryPolicy::default(),
      lease: Duration::seconds(60),
      quotas: HashMap::new(),
    };
    store.run_migrations()?;

    Ok(store)
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// How long a claimed item belongs to its drainer before it can be reclaimed.
  pub fn with_lease(mut self, lease: Duration) -> Self {
    self.lease = lease;
    self
  }

  pub fn with_quota(mut self, store_name: impl Into<String>, quota: StoreQuota) -> Self {
    self.quotas.insert(store_name.into(), quota);
    self
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.retry
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  /// Bring the schema up to the latest version.
  fn run_migrations(&self) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (idx, migration) in MIGRATIONS.iter().enumerate().skip(version.max(0) as usize) {
      tx.execute_batch(migration)?;
      tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
      debug!(version = idx + 1, "Applied store migration");
    }

    tx.commit()?;
    Ok(())
  }

  fn set_dead_letter_by_rowid(tx: &Transaction<'_>, rowid: i64, reason: &str) -> StoreResult<()> {
    tx.execute(
      "UPDATE sync_queue SET status = 'dead-letter', lease_until = NULL, last_error = ?1
       WHERE rowid = ?2",
      params![reason, rowid],
    )?;
    Ok(())
  }

  /// Fails with `ClaimLost` unless the row is still in flight under the
  /// claim `drain_next` handed out; returns the row's attempt count.
  fn check_claim(tx: &Transaction<'_>, claimed: &SyncQueueItem) -> StoreResult<i64> {
    let row: Option<(i64, String, Option<i64>)> = tx
      .query_row(
        "SELECT attempts, status, last_attempt FROM sync_queue WHERE id = ?1",
        params![claimed.id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let (attempts, status, last_attempt) = row.ok_or(StoreError::UnknownItem(claimed.id))?;
    let claim = claimed.last_attempt.map(|t| t.timestamp_millis());
    if status != QueueStatus::InFlight.as_str() || claim.is_none() || last_attempt != claim {
      debug!(id = %claimed.id, %status, "Claim no longer held");
      return Err(StoreError::ClaimLost(claimed.id));
    }
    Ok(attempts)
  }

  fn select_items(
    &self,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
  ) -> StoreResult<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM sync_queue WHERE {} ORDER BY created_at, seq",
      QUEUE_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
      .query_map(args, |row| Ok(RawItem::from_row(row)))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(
      rows
        .into_iter()
        .filter_map(|raw| match raw.map_err(|e| e.to_string()).and_then(RawItem::decode) {
          Ok(item) => Some(item),
          Err(reason) => {
            warn!(%reason, "Skipping unreadable queue row");
            None
          }
        })
        .collect(),
    )
  }
}

impl DurableStore for SqliteStore {
  fn get(&self, store_name: &str, key: &str) -> StoreResult<Option<CacheEntry>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let row = tx.query_row(
      "SELECT payload, content_type, entity_ref, last_updated, ttl_secs FROM cache_entries
       WHERE store_name = ?1 AND key = ?2",
      params![store_name, key],
      |row| {
        Ok((
          row.get::<_, Vec<u8>>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, Option<i64>>(4)?,
        ))
      },
    );

    let entry = match row {
      Ok((payload, content_type, entity_ref, last_updated, ttl_secs)) => {
        millis_to_datetime(last_updated).map(|last_updated| CacheEntry {
          store_name: store_name.to_string(),
          key: key.to_string(),
          payload,
          content_type,
          entity_ref,
          last_updated,
          ttl: ttl_secs.map(Duration::seconds),
        })
      }
      Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
      Err(e) if is_decode_error(&e) => None,
      Err(e) => return Err(e.into()),
    };

    match entry {
      Some(entry) => {
        tx.execute(
          "UPDATE cache_entries
           SET access_seq = (SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cache_entries)
           WHERE store_name = ?1 AND key = ?2",
          params![store_name, key],
        )?;
        tx.commit()?;
        Ok(Some(entry))
      }
      None => {
        // Unreadable rows are treated as absent so the caller re-fetches
        warn!(store_name, key, "Dropping unreadable cache entry");
        tx.execute(
          "DELETE FROM cache_entries WHERE store_name = ?1 AND key = ?2",
          params![store_name, key],
        )?;
        tx.commit()?;
        Ok(None)
      }
    }
  }

  fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(quota) = self.quotas.get(&entry.store_name) {
      let (count, bytes): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache_entries
         WHERE store_name = ?1 AND key != ?2",
        params![entry.store_name, entry.key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )?;

      if !fits(quota, count as usize + 1, bytes as u64 + entry.size()) {
        return Err(StoreError::QuotaExceeded {
          store: entry.store_name.clone(),
        });
      }
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (store_name, key, payload, content_type, entity_ref, last_updated, ttl_secs, size, access_seq)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
         (SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cache_entries))",
      params![
        entry.store_name,
        entry.key,
        entry.payload,
        entry.content_type,
        entry.entity_ref,
        entry.last_updated.timestamp_millis(),
        entry.ttl.map(|ttl| ttl.num_seconds()),
        entry.size() as i64,
      ],
    )?;

    tx.commit()?;
    Ok(())
  }

  fn evict_lru(&self, entry: &CacheEntry) -> StoreResult<usize> {
    let quota = match self.quotas.get(&entry.store_name) {
      Some(quota) => *quota,
      None => return Ok(0),
    };

    if !fits(&quota, 1, entry.size()) {
      return Err(StoreError::QuotaExceeded {
        store: entry.store_name.clone(),
      });
    }

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let candidates: Vec<(String, i64)> = {
      let mut stmt = tx.prepare(
        "SELECT key, size FROM cache_entries
         WHERE store_name = ?1 AND key != ?2
         ORDER BY access_seq ASC",
      )?;
      let rows = stmt
        .query_map(params![entry.store_name, entry.key], |row| {
          Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      rows
    };

    let mut count = candidates.len();
    let mut bytes: u64 = candidates.iter().map(|(_, size)| *size as u64).sum();
    let mut evicted = 0;

    for (key, size) in candidates {
      if fits(&quota, count + 1, bytes + entry.size()) {
        break;
      }
      tx.execute(
        "DELETE FROM cache_entries WHERE store_name = ?1 AND key = ?2",
        params![entry.store_name, key],
      )?;
      count -= 1;
      bytes -= size as u64;
      evicted += 1;
    }

    tx.commit()?;
    debug!(store = %entry.store_name, evicted, "Evicted least recently used entries");
    Ok(evicted)
  }

  fn invalidate(&self, store_name: &str, key: &str) -> StoreResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let removed = tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?1 AND key = ?2",
      params![store_name, key],
    )?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn invalidate_entity(&self, store_name: &str, entity_id: &str) -> StoreResult<Vec<String>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let keys: Vec<String> = {
      let mut stmt = tx.prepare(
        "SELECT key FROM cache_entries
         WHERE store_name = ?1 AND (entity_ref = ?2 OR key = ?2)",
      )?;
      let rows = stmt
        .query_map(params![store_name, entity_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      rows
    };

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?1 AND (entity_ref = ?2 OR key = ?2)",
      params![store_name, entity_id],
    )?;
    tx.commit()?;

    Ok(keys)
  }

  fn enqueue(&self, item: &SyncQueueItem) -> StoreResult<()> {
    let payload = serde_json::to_string(&item.payload)?;

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "INSERT INTO sync_queue
         (id, seq, operation, store_name, entity_id, payload, base_version, attempts,
          last_attempt, next_attempt_at, lease_until, created_at, status, last_error)
       VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_queue), ?2, ?3, ?4, ?5, ?6, ?7,
          ?8, ?9, NULL, ?10, ?11, ?12)",
      params![
        item.id.to_string(),
        item.operation.as_str(),
        item.store_name,
        item.entity_id,
        payload,
        item.base_version.map(|t| t.timestamp_millis()),
        item.attempts,
        item.last_attempt.map(|t| t.timestamp_millis()),
        item.next_attempt_at.timestamp_millis(),
        item.created_at.timestamp_millis(),
        item.status.as_str(),
        item.last_error,
      ],
    )?;
    tx.commit()?;

    debug!(id = %item.id, store = %item.store_name, entity = %item.entity_id, "Enqueued mutation");
    Ok(())
  }

  fn drain_next(&self, store_name: Option<&str>) -> StoreResult<Option<SyncQueueItem>> {
    let now = self.clock.now();
    let now_ms = now.timestamp_millis();
    let lease_until = (now + self.lease).timestamp_millis();

    let sql = format!(
      "SELECT {} FROM sync_queue q
       WHERE (q.status = 'pending' OR (q.status = 'in-flight' AND q.lease_until <= ?1))
         AND q.next_attempt_at <= ?1
         AND (?2 IS NULL OR q.store_name = ?2)
         AND NOT EXISTS (
           SELECT 1 FROM sync_queue p
           WHERE p.store_name = q.store_name
             AND p.entity_id = q.entity_id
             AND p.status IN ('pending', 'in-flight')
             AND (p.created_at < q.created_at OR (p.created_at = q.created_at AND p.seq < q.seq))
         )
       ORDER BY q.created_at, q.seq
       LIMIT 1",
      QUEUE_COLUMNS
    );

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let claimed = loop {
      let candidate = tx
        .query_row(&sql, params![now_ms, store_name], |row| {
          let rowid: i64 = row.get(0)?;
          Ok((rowid, RawItem::from_row(row)))
        })
        .optional()?;

      let Some((rowid, raw)) = candidate else {
        break None;
      };

      match raw.map_err(|e| e.to_string()).and_then(RawItem::decode) {
        Ok(mut item) => {
          tx.execute(
            "UPDATE sync_queue SET status = 'in-flight', lease_until = ?1, last_attempt = ?2
             WHERE rowid = ?3",
            params![lease_until, now_ms, rowid],
          )?;
          item.status = QueueStatus::InFlight;
          item.last_attempt = Some(now);
          break Some(item);
        }
        Err(reason) => {
          warn!(rowid, %reason, "Dead-lettering unreadable queue row");
          Self::set_dead_letter_by_rowid(&tx, rowid, &format!("unreadable record: {}", reason))?;
        }
      }
    };

    tx.commit()?;
    Ok(claimed)
  }

  fn mark_synced(&self, claimed: &SyncQueueItem) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    Self::check_claim(&tx, claimed)?;
    tx.execute(
      "UPDATE sync_queue SET status = 'synced', lease_until = NULL, last_error = NULL
       WHERE id = ?1",
      params![claimed.id.to_string()],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn mark_failed(&self, claimed: &SyncQueueItem, error: &str) -> StoreResult<QueueStatus> {
    let now = self.clock.now();
    let id = claimed.id;

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempts = Self::check_claim(&tx, claimed)?;

    let attempts = attempts.max(0) as u32 + 1;
    let next = if self.retry.is_exhausted(attempts) {
      tx.execute(
        "UPDATE sync_queue
         SET status = 'dead-letter', attempts = ?1, lease_until = NULL, last_error = ?2
         WHERE id = ?3",
        params![attempts, error, id.to_string()],
      )?;
      QueueStatus::DeadLetter
    } else {
      let next_attempt_at = now + self.retry.delay_for(attempts);
      tx.execute(
        "UPDATE sync_queue
         SET status = 'pending', attempts = ?1, next_attempt_at = ?2, lease_until = NULL,
             last_error = ?3
         WHERE id = ?4",
        params![
          attempts,
          next_attempt_at.timestamp_millis(),
          error,
          id.to_string()
        ],
      )?;
      QueueStatus::Pending
    };

    tx.commit()?;
    Ok(next)
  }

  fn mark_dead_letter(&self, id: Uuid, reason: &str) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
      "UPDATE sync_queue SET status = 'dead-letter', lease_until = NULL, last_error = ?1
       WHERE id = ?2 AND status != 'synced'",
      params![reason, id.to_string()],
    )?;
    tx.commit()?;

    if updated == 0 {
      return Err(StoreError::UnknownItem(id));
    }
    Ok(())
  }

  fn retry_dead_letter(&self, id: Uuid) -> StoreResult<bool> {
    let now_ms = self.clock.now().timestamp_millis();

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
      "UPDATE sync_queue
       SET status = 'pending', attempts = 0, next_attempt_at = ?1, last_error = NULL
       WHERE id = ?2 AND status = 'dead-letter'",
      params![now_ms, id.to_string()],
    )?;
    tx.commit()?;

    Ok(updated > 0)
  }

  fn rebase_pending(
    &self,
    store_name: &str,
    entity_id: &str,
    base_version: Option<DateTime<Utc>>,
  ) -> StoreResult<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rebased = tx.execute(
      "UPDATE sync_queue SET base_version = ?1
       WHERE store_name = ?2 AND entity_id = ?3 AND status = 'pending'",
      params![
        base_version.map(|t| t.timestamp_millis()),
        store_name,
        entity_id
      ],
    )?;
    tx.commit()?;
    Ok(rebased)
  }

  fn release_backoff(&self) -> StoreResult<usize> {
    let now_ms = self.clock.now().timestamp_millis();

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let released = tx.execute(
      "UPDATE sync_queue SET next_attempt_at = ?1
       WHERE status = 'pending' AND next_attempt_at > ?1",
      params![now_ms],
    )?;
    tx.commit()?;

    Ok(released)
  }

  fn queue_item(&self, id: Uuid) -> StoreResult<Option<SyncQueueItem>> {
    Ok(
      self
        .select_items("id = ?1", &[&id.to_string()])?
        .into_iter()
        .next(),
    )
  }

  fn items_with_status(&self, status: QueueStatus) -> StoreResult<Vec<SyncQueueItem>> {
    self.select_items("status = ?1", &[&status.as_str()])
  }

  fn pending_for_entity(
    &self,
    store_name: &str,
    entity_id: &str,
  ) -> StoreResult<Vec<SyncQueueItem>> {
    self.select_items(
      "store_name = ?1 AND entity_id = ?2 AND status IN ('pending', 'in-flight')",
      &[&store_name, &entity_id],
    )
  }

  fn queue_counts(&self) -> StoreResult<QueueCounts> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
      let count = count as usize;
      match status.parse::<QueueStatus>() {
        Ok(QueueStatus::Pending) => counts.pending += count,
        Ok(QueueStatus::InFlight) => counts.in_flight += count,
        Ok(QueueStatus::Synced) => counts.synced += count,
        Ok(QueueStatus::DeadLetter) => counts.dead_letter += count,
        Err(reason) => warn!(%reason, count, "Ignoring queue rows with unknown status"),
      }
    }

    Ok(counts)
  }

  fn next_due_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let next: Option<i64> = conn.query_row(
      "SELECT MIN(CASE WHEN status = 'pending' THEN next_attempt_at ELSE lease_until END)
       FROM sync_queue WHERE status IN ('pending', 'in-flight')",
      [],
      |row| row.get(0),
    )?;
    Ok(next.and_then(millis_to_datetime))
  }

  fn purge_synced(&self) -> StoreResult<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let removed = tx.execute("DELETE FROM sync_queue WHERE status = 'synced'", [])?;
    tx.commit()?;
    Ok(removed)
  }

  fn register_tag(&self, tag: &str) -> StoreResult<()> {
    let now_ms = self.clock.now().timestamp_millis();
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO sync_registrations (tag, registered_at) VALUES (?1, ?2)",
      params![tag, now_ms],
    )?;
    Ok(())
  }

  fn unregister_tag(&self, tag: &str) -> StoreResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM sync_registrations WHERE tag = ?1", params![tag])?;
    Ok(removed > 0)
  }

  fn unregister_tag_if_idle(&self, tag: &str, store_names: &[String]) -> StoreResult<bool> {
    let scope = if store_names.is_empty() {
      String::new()
    } else {
      let placeholders: Vec<String> = (0..store_names.len()).map(|i| format!("?{}", i + 2)).collect();
      format!("AND store_name IN ({})", placeholders.join(", "))
    };
    let sql = format!(
      "DELETE FROM sync_registrations
       WHERE tag = ?1 AND NOT EXISTS (
         SELECT 1 FROM sync_queue WHERE status IN ('pending', 'in-flight') {}
       )",
      scope
    );

    let args = std::iter::once(tag).chain(store_names.iter().map(String::as_str));
    let conn = self.lock()?;
    let removed = conn.execute(&sql, params_from_iter(args))?;
    Ok(removed > 0)
  }

  fn registered_tags(&self) -> StoreResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT tag FROM sync_registrations ORDER BY tag")?;
    let tags = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
  }
}

/// Queue row as stored, before validation.
struct RawItem {
  id: String,
  operation: String,
  store_name: String,
  entity_id: String,
  payload: String,
  base_version: Option<i64>,
  attempts: i64,
  last_attempt: Option<i64>,
  next_attempt_at: i64,
  created_at: i64,
  status: String,
  last_error: Option<String>,
}

impl RawItem {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(1)?,
      operation: row.get(2)?,
      store_name: row.get(3)?,
      entity_id: row.get(4)?,
      payload: row.get(5)?,
      base_version: row.get(6)?,
      attempts: row.get(7)?,
      last_attempt: row.get(8)?,
      next_attempt_at: row.get(9)?,
      created_at: row.get(10)?,
      status: row.get(11)?,
      last_error: row.get(12)?,
    })
  }

  fn decode(self) -> Result<SyncQueueItem, String> {
    let id = Uuid::parse_str(&self.id).map_err(|e| format!("invalid id '{}': {}", self.id, e))?;
    let payload =
      serde_json::from_str(&self.payload).map_err(|e| format!("invalid payload: {}", e))?;
    let attempts =
      u32::try_from(self.attempts).map_err(|_| format!("invalid attempts {}", self.attempts))?;

    Ok(SyncQueueItem {
      id,
      operation: self.operation.parse()?,
      store_name: self.store_name,
      entity_id: self.entity_id,
      payload,
      base_version: self.base_version.map(decode_millis).transpose()?,
      attempts,
      last_attempt: self.last_attempt.map(decode_millis).transpose()?,
      next_attempt_at: decode_millis(self.next_attempt_at)?,
      created_at: decode_millis(self.created_at)?,
      status: self.status.parse()?,
      last_error: self.last_error,
    })
  }
}

fn fits(quota: &StoreQuota, entries: usize, bytes: u64) -> bool {
  quota.max_entries.map_or(true, |max| entries <= max)
    && quota.max_bytes.map_or(true, |max| bytes <= max)
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms)
}

fn decode_millis(ms: i64) -> Result<DateTime<Utc>, String> {
  millis_to_datetime(ms).ok_or_else(|| format!("invalid timestamp {}", ms))
}

fn is_decode_error(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::InvalidColumnType(..)
      | rusqlite::Error::FromSqlConversionFailure(..)
      | rusqlite::Error::IntegralValueOutOfRange(..)
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::model::Operation;
  use crate::testing::{retry_policy, start_time};
  use serde_json::json;

  fn store() -> (SqliteStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = SqliteStore::open_in_memory()
      .unwrap()
      .with_clock(clock.clone())
      .with_retry_policy(retry_policy());
    (store, clock)
  }

  fn item(
    store: &SqliteStore,
    clock: &ManualClock,
    entity: &str,
    payload: serde_json::Value,
  ) -> SyncQueueItem {
    let item = SyncQueueItem::new(
      Operation::Update,
      "attendance",
      Some(entity.to_string()),
      payload,
      clock.now(),
    );
    store.enqueue(&item).unwrap();
    item
  }

  #[test]
  fn test_put_and_get_roundtrip() {
    let (store, clock) = store();
    let entry = CacheEntry::new("students", "S1", b"{\"name\":\"Ada\"}".to_vec(), clock.now())
      .with_ttl(Some(Duration::seconds(60)))
      .with_content_type(Some("application/json".into()));
    store.put(&entry).unwrap();

    let cached = store.get("students", "S1").unwrap().unwrap();
    assert_eq!(cached.payload, entry.payload);
    assert_eq!(cached.ttl, Some(Duration::seconds(60)));
    assert_eq!(cached.content_type.as_deref(), Some("application/json"));
    assert!(store.get("teachers", "S1").unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let (store, clock) = store();
    store
      .put(&CacheEntry::new("students", "S1", b"old".to_vec(), clock.now()))
      .unwrap();
    store
      .put(&CacheEntry::new("students", "S1", b"new".to_vec(), clock.now()))
      .unwrap();
    assert_eq!(store.get("students", "S1").unwrap().unwrap().payload, b"new");
  }

  #[test]
  fn test_quota_eviction_drops_oldest_first() {
    let (store, clock) = store();
    let store = store.with_quota(
      "analytics",
      StoreQuota {
        max_entries: Some(100),
        max_bytes: None,
      },
    );

    for i in 1..=100 {
      let entry = CacheEntry::new("analytics", format!("A{}", i), b"x".to_vec(), clock.now());
      store.put(&entry).unwrap();
    }

    let a101 = CacheEntry::new("analytics", "A101", b"x".to_vec(), clock.now());
    assert!(matches!(
      store.put(&a101),
      Err(StoreError::QuotaExceeded { .. })
    ));

    assert_eq!(store.evict_lru(&a101).unwrap(), 1);
    store.put(&a101).unwrap();

    assert!(store.get("analytics", "A1").unwrap().is_none());
    assert!(store.get("analytics", "A2").unwrap().is_some());
    assert!(store.get("analytics", "A101").unwrap().is_some());
  }

  #[test]
  fn test_byte_quota_evicts_as_many_as_needed() {
    let (store, clock) = store();
    let store = store.with_quota(
      "analytics",
      StoreQuota {
        max_entries: None,
        max_bytes: Some(40),
      },
    );

    for i in 1..=4 {
      // 2 key bytes + 8 payload bytes
      let entry = CacheEntry::new("analytics", format!("A{}", i), vec![0; 8], clock.now());
      store.put(&entry).unwrap();
    }

    let big = CacheEntry::new("analytics", "A5", vec![0; 18], clock.now());
    assert_eq!(store.evict_lru(&big).unwrap(), 2);
    store.put(&big).unwrap();
    assert!(store.get("analytics", "A1").unwrap().is_none());
    assert!(store.get("analytics", "A2").unwrap().is_none());
    assert!(store.get("analytics", "A3").unwrap().is_some());
  }

  #[test]
  fn test_get_refreshes_lru_position() {
    let (store, clock) = store();
    let store = store.with_quota(
      "analytics",
      StoreQuota {
        max_entries: Some(2),
        max_bytes: None,
      },
    );
    for key in ["A1", "A2"] {
      store
        .put(&CacheEntry::new("analytics", key, b"x".to_vec(), clock.now()))
        .unwrap();
    }
    store.get("analytics", "A1").unwrap();

    let a3 = CacheEntry::new("analytics", "A3", b"x".to_vec(), clock.now());
    store.evict_lru(&a3).unwrap();
    store.put(&a3).unwrap();

    assert!(store.get("analytics", "A1").unwrap().is_some());
    assert!(store.get("analytics", "A2").unwrap().is_none());
  }

  #[test]
  fn test_entry_larger_than_quota_fails_loudly() {
    let (store, clock) = store();
    let store = store.with_quota(
      "analytics",
      StoreQuota {
        max_entries: None,
        max_bytes: Some(4),
      },
    );
    let huge = CacheEntry::new("analytics", "A1", vec![0; 64], clock.now());
    assert!(matches!(
      store.evict_lru(&huge),
      Err(StoreError::QuotaExceeded { .. })
    ));
  }

  #[test]
  fn test_corrupt_cache_row_treated_as_absent() {
    let (store, clock) = store();
    store
      .put(&CacheEntry::new("students", "S1", b"{}".to_vec(), clock.now()))
      .unwrap();
    store
      .lock()
      .unwrap()
      .execute(
        "UPDATE cache_entries SET last_updated = 'garbage' WHERE key = 'S1'",
        [],
      )
      .unwrap();

    assert!(store.get("students", "S1").unwrap().is_none());
    // The row is gone, not just skipped
    let remaining: i64 = store
      .lock()
      .unwrap()
      .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
      .unwrap();
    assert_eq!(remaining, 0);
  }

  #[test]
  fn test_invalidate_entity_removes_related_keys() {
    let (store, clock) = store();
    store
      .put(
        &CacheEntry::new("students", "/api/students/S1", b"{}".to_vec(), clock.now())
          .with_entity_ref(Some("S1".into())),
      )
      .unwrap();
    store
      .put(&CacheEntry::new("students", "S1", b"{}".to_vec(), clock.now()))
      .unwrap();
    store
      .put(&CacheEntry::new("students", "S2", b"{}".to_vec(), clock.now()))
      .unwrap();

    let mut removed = store.invalidate_entity("students", "S1").unwrap();
    removed.sort();
    assert_eq!(removed, vec!["/api/students/S1".to_string(), "S1".to_string()]);
    assert!(store.get("students", "S2").unwrap().is_some());
  }

  #[test]
  fn test_drain_returns_oldest_and_marks_in_flight() {
    let (store, clock) = store();
    let first = item(&store, &clock, "S1", json!({"status": "present"}));
    clock.advance(Duration::milliseconds(5));
    let _second = item(&store, &clock, "S2", json!({"status": "absent"}));

    let drained = store.drain_next(None).unwrap().unwrap();
    assert_eq!(drained.id, first.id);
    assert_eq!(drained.status, QueueStatus::InFlight);

    let stored = store.queue_item(first.id).unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::InFlight);
  }

  #[test]
  fn test_in_flight_item_not_returned_twice() {
    let (store, clock) = store();
    let only = item(&store, &clock, "S1", json!({}));

    assert_eq!(store.drain_next(None).unwrap().unwrap().id, only.id);
    assert!(store.drain_next(None).unwrap().is_none());
  }

  #[test]
  fn test_same_entity_waits_for_older_mutation() {
    let (store, clock) = store();
    let m1 = item(&store, &clock, "S1", json!({"status": "absent"}));
    // Same millisecond; insertion order breaks the tie
    let m2 = item(&store, &clock, "S1", json!({"status": "present"}));
    let other = item(&store, &clock, "S2", json!({"status": "late"}));

    let claimed = store.drain_next(None).unwrap().unwrap();
    assert_eq!(claimed.id, m1.id);
    // m2 is blocked while m1 is in flight; S2 is not
    assert_eq!(store.drain_next(None).unwrap().unwrap().id, other.id);
    assert!(store.drain_next(None).unwrap().is_none());

    // m1 fails and backs off; m2 stays blocked behind it
    assert_eq!(
      store.mark_failed(&claimed, "offline").unwrap(),
      QueueStatus::Pending
    );
    assert!(store.drain_next(None).unwrap().is_none());

    clock.advance(Duration::seconds(1));
    let claimed = store.drain_next(None).unwrap().unwrap();
    assert_eq!(claimed.id, m1.id);
    store.mark_synced(&claimed).unwrap();
    assert_eq!(store.drain_next(None).unwrap().unwrap().id, m2.id);
  }

  #[test]
  fn test_drain_scoped_to_store() {
    let (store, clock) = store();
    item(&store, &clock, "S1", json!({}));
    assert!(store.drain_next(Some("grades")).unwrap().is_none());
    assert!(store.drain_next(Some("attendance")).unwrap().is_some());
  }

  #[test]
  fn test_fifth_failure_dead_letters() {
    let (store, clock) = store();
    let doomed = item(&store, &clock, "S1", json!({}));

    for attempt in 1..=5 {
      clock.advance(Duration::seconds(60));
      let claimed = store.drain_next(None).unwrap().unwrap();
      assert_eq!(claimed.id, doomed.id);
      let status = store.mark_failed(&claimed, "503").unwrap();
      if attempt < 5 {
        assert_eq!(status, QueueStatus::Pending);
      } else {
        assert_eq!(status, QueueStatus::DeadLetter);
      }
    }

    clock.advance(Duration::hours(1));
    assert!(store.drain_next(None).unwrap().is_none());

    let dead = store.items_with_status(QueueStatus::DeadLetter).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 5);
    assert_eq!(dead[0].last_error.as_deref(), Some("503"));
  }

  #[test]
  fn test_backoff_gate_delays_retry() {
    let (store, clock) = store();
    item(&store, &clock, "S1", json!({}));

    let claimed = store.drain_next(None).unwrap().unwrap();
    store.mark_failed(&claimed, "timeout").unwrap();
    clock.advance(Duration::seconds(1));
    let claimed = store.drain_next(None).unwrap().unwrap();
    store.mark_failed(&claimed, "timeout").unwrap();

    // Second failure backs off for two seconds
    clock.advance(Duration::seconds(1));
    assert!(store.drain_next(None).unwrap().is_none());
    clock.advance(Duration::seconds(1));
    assert!(store.drain_next(None).unwrap().is_some());
  }

  #[test]
  fn test_release_backoff_makes_items_due() {
    let (store, clock) = store();
    item(&store, &clock, "S1", json!({}));
    let claimed = store.drain_next(None).unwrap().unwrap();
    store.mark_failed(&claimed, "offline").unwrap();
    assert!(store.drain_next(None).unwrap().is_none());

    assert_eq!(store.release_backoff().unwrap(), 1);
    assert!(store.drain_next(None).unwrap().is_some());
  }

  #[test]
  fn test_retry_dead_letter_resets_budget() {
    let (store, clock) = store();
    let dead = item(&store, &clock, "S1", json!({}));
    store.mark_dead_letter(dead.id, "conflict declined").unwrap();
    assert!(store.drain_next(None).unwrap().is_none());

    assert!(store.retry_dead_letter(dead.id).unwrap());
    let revived = store.queue_item(dead.id).unwrap().unwrap();
    assert_eq!(revived.status, QueueStatus::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(store.drain_next(None).unwrap().is_some());

    assert!(!store.retry_dead_letter(Uuid::new_v4()).unwrap());
  }

  #[test]
  fn test_expired_lease_is_reclaimed() {
    let (store, clock) = store();
    let store = store.with_lease(Duration::seconds(30));
    let stuck = item(&store, &clock, "S1", json!({}));

    assert!(store.drain_next(None).unwrap().is_some());
    clock.advance(Duration::seconds(29));
    assert!(store.drain_next(None).unwrap().is_none());
    clock.advance(Duration::seconds(1));

    let reclaimed = store.drain_next(None).unwrap().unwrap();
    assert_eq!(reclaimed.id, stuck.id);
    assert_eq!(reclaimed.attempts, 0);
  }

  #[test]
  fn test_corrupt_queue_row_is_dead_lettered() {
    let (store, clock) = store();
    let broken = item(&store, &clock, "S1", json!({}));
    let fine = item(&store, &clock, "S2", json!({}));
    store
      .lock()
      .unwrap()
      .execute(
        "UPDATE sync_queue SET payload = '{not json' WHERE id = ?1",
        params![broken.id.to_string()],
      )
      .unwrap();

    assert_eq!(store.drain_next(None).unwrap().unwrap().id, fine.id);
    assert_eq!(store.queue_counts().unwrap().dead_letter, 1);
  }

  #[test]
  fn test_counts_next_due_and_purge() {
    let (store, clock) = store();
    let a = item(&store, &clock, "S1", json!({}));
    let b = item(&store, &clock, "S2", json!({}));
    assert_eq!(store.next_due_at().unwrap(), Some(a.next_attempt_at));

    let claimed = store.drain_next(None).unwrap().unwrap();
    store.mark_synced(&claimed).unwrap();

    let counts = store.queue_counts().unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.synced, 1);
    assert_eq!(counts.outstanding(), 1);

    assert_eq!(store.purge_synced().unwrap(), 1);
    assert!(store.queue_item(a.id).unwrap().is_none());
    assert!(store.queue_item(b.id).unwrap().is_some());
  }

  #[test]
  fn test_mark_synced_unknown_item() {
    let (store, clock) = store();
    let never_queued = SyncQueueItem::new(
      Operation::Update,
      "attendance",
      Some("S1".into()),
      json!({}),
      clock.now(),
    );
    assert!(matches!(
      store.mark_synced(&never_queued),
      Err(StoreError::UnknownItem(_))
    ));
  }

  #[test]
  fn test_late_worker_cannot_touch_reclaimed_item() {
    let (store, clock) = store();
    let store = store.with_lease(Duration::seconds(30));
    let slow = item(&store, &clock, "S1", json!({}));

    let first_claim = store.drain_next(None).unwrap().unwrap();
    clock.advance(Duration::seconds(31));
    let second_claim = store.drain_next(None).unwrap().unwrap();
    assert_eq!(second_claim.id, slow.id);

    // The first worker finishes late; the row still belongs to the second
    assert!(matches!(
      store.mark_failed(&first_claim, "timeout"),
      Err(StoreError::ClaimLost(_))
    ));
    assert!(matches!(
      store.mark_synced(&first_claim),
      Err(StoreError::ClaimLost(_))
    ));
    let row = store.queue_item(slow.id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::InFlight);
    assert_eq!(row.attempts, 0);
    assert!(store.drain_next(None).unwrap().is_none());

    store.mark_synced(&second_claim).unwrap();
    assert_eq!(
      store.queue_item(slow.id).unwrap().unwrap().status,
      QueueStatus::Synced
    );
  }

  #[test]
  fn test_unclaimed_item_cannot_be_marked() {
    let (store, clock) = store();
    let pending = item(&store, &clock, "S1", json!({}));
    assert!(matches!(
      store.mark_failed(&pending, "offline"),
      Err(StoreError::ClaimLost(_))
    ));
  }

  #[test]
  fn test_rebase_pending_touches_only_that_entity() {
    let (store, clock) = store();
    let base = clock.now();
    let later = base + Duration::minutes(5);
    let m1 = SyncQueueItem::new(
      Operation::Update,
      "grades",
      Some("G1".into()),
      json!({"score": 1}),
      clock.now(),
    )
    .with_base_version(Some(base));
    let m2 = SyncQueueItem::new(
      Operation::Update,
      "grades",
      Some("G1".into()),
      json!({"score": 2}),
      clock.now(),
    )
    .with_base_version(Some(base));
    let other = SyncQueueItem::new(
      Operation::Update,
      "grades",
      Some("G2".into()),
      json!({"score": 3}),
      clock.now(),
    )
    .with_base_version(Some(base));
    for queued in [&m1, &m2, &other] {
      store.enqueue(queued).unwrap();
    }

    let claimed = store.drain_next(None).unwrap().unwrap();
    assert_eq!(claimed.id, m1.id);
    assert_eq!(store.rebase_pending("grades", "G1", Some(later)).unwrap(), 1);

    let read = |id| store.queue_item(id).unwrap().unwrap().base_version;
    assert_eq!(read(m1.id), Some(base));
    assert_eq!(read(m2.id), Some(later));
    assert_eq!(read(other.id), Some(base));

    assert_eq!(store.rebase_pending("grades", "G1", None).unwrap(), 1);
    assert_eq!(read(m2.id), None);
  }

  #[test]
  fn test_registrations() {
    let (store, _clock) = store();
    store.register_tag("teacher-portal").unwrap();
    store.register_tag("teacher-portal").unwrap();
    store.register_tag("coordinator-portal").unwrap();
    assert_eq!(
      store.registered_tags().unwrap(),
      vec!["coordinator-portal".to_string(), "teacher-portal".to_string()]
    );
    assert!(store.unregister_tag("teacher-portal").unwrap());
    assert!(!store.unregister_tag("teacher-portal").unwrap());
  }

  #[test]
  fn test_unregister_if_idle_keeps_tag_with_outstanding_writes() {
    let (store, clock) = store();
    let scope = vec!["attendance".to_string(), "grades".to_string()];
    store.register_tag("teacher-portal").unwrap();
    let queued = item(&store, &clock, "S1", json!({}));

    assert!(!store.unregister_tag_if_idle("teacher-portal", &scope).unwrap());
    assert!(!store.unregister_tag_if_idle("teacher-portal", &[]).unwrap());
    assert_eq!(store.registered_tags().unwrap(), vec!["teacher-portal"]);

    // Writes to stores outside the scope do not hold the tag
    assert!(store
      .unregister_tag_if_idle("teacher-portal", &["grades".to_string()])
      .unwrap());

    store.register_tag("teacher-portal").unwrap();
    let claimed = store.drain_next(None).unwrap().unwrap();
    assert_eq!(claimed.id, queued.id);
    assert!(!store.unregister_tag_if_idle("teacher-portal", &scope).unwrap());
    store.mark_synced(&claimed).unwrap();
    assert!(store.unregister_tag_if_idle("teacher-portal", &scope).unwrap());
    assert!(store.registered_tags().unwrap().is_empty());
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    let queued = {
      let store = SqliteStore::open(&path).unwrap();
      let item = SyncQueueItem::new(
        Operation::Create,
        "attendance",
        Some("S1".into()),
        json!({"studentId": "S1"}),
        Utc::now(),
      );
      store.enqueue(&item).unwrap();
      store.register_tag("student-portal").unwrap();
      item
    };

    let reopened = SqliteStore::open(&path).unwrap();
    let restored = reopened.queue_item(queued.id).unwrap().unwrap();
    assert_eq!(restored.payload, queued.payload);
    assert_eq!(restored.status, QueueStatus::Pending);
    assert_eq!(reopened.registered_tags().unwrap(), vec!["student-portal"]);
  }
}
