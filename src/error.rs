//! Error types for the durable store and the network transport.
//!
//! Everything above these two layers reports outcomes as values; only
//! [`StoreError`] is allowed to escape a public operation as a hard failure.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the durable local store.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The store's configured quota cannot hold the entry; evict and retry.
  #[error("quota exceeded for store '{store}'")]
  QuotaExceeded { store: String },

  /// Underlying SQLite failure.
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// A queue payload could not be encoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// No queue item has the given id.
  #[error("unknown queue item {0}")]
  UnknownItem(uuid::Uuid),

  /// The item's lease expired and another drainer claimed it.
  #[error("queue item {0} was reclaimed by another drainer")]
  ClaimLost(uuid::Uuid),

  /// Another thread panicked while holding the connection.
  #[error("store connection lock poisoned")]
  LockPoisoned,

  /// I/O failure while preparing the database location.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// A specialized `Result` type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Transient failures of a single network attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  /// The attempt exceeded its bounded timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// No connection could be established.
  #[error("connection failed: {0}")]
  Connect(String),

  /// The request failed after the connection was made.
  #[error("request failed: {0}")]
  Request(String),
}
