//! Versioned schema for the durable store.
//!
//! Each entry in [`MIGRATIONS`] moves `PRAGMA user_version` forward by one.

/// Migrations in order; index + 1 is the resulting schema version.
pub const MIGRATIONS: &[&str] = &[SCHEMA_V1];

const SCHEMA_V1: &str = r#"
-- Cached responses and entity snapshots
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    key TEXT NOT NULL,
    payload BLOB NOT NULL,
    content_type TEXT,
    entity_ref TEXT,
    last_updated INTEGER NOT NULL,
    ttl_secs INTEGER,
    size INTEGER NOT NULL,
    access_seq INTEGER NOT NULL,
    PRIMARY KEY (store_name, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_updated
    ON cache_entries(store_name, last_updated);

CREATE INDEX IF NOT EXISTS idx_cache_entries_entity
    ON cache_entries(store_name, entity_ref);

CREATE INDEX IF NOT EXISTS idx_cache_entries_lru
    ON cache_entries(store_name, access_seq);

-- Pending mutations
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    operation TEXT NOT NULL,
    store_name TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    base_version INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt INTEGER,
    next_attempt_at INTEGER NOT NULL,
    lease_until INTEGER,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status
    ON sync_queue(status, created_at, seq);

CREATE INDEX IF NOT EXISTS idx_sync_queue_entity
    ON sync_queue(store_name, entity_id, created_at, seq);

-- Deferred background sync triggers
CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    registered_at INTEGER NOT NULL
);
"#;
