//! Offline-first sync layer for learning platform portals.
//!
//! Pages talk to the [`intercept::Interceptor`], which serves reads from a
//! durable SQLite cache and hands writes to the [`queue::MutationEngine`].
//! Writes that cannot reach the server are queued and replayed later by the
//! [`sync::SyncCoordinator`]; progress is pushed to pages over the
//! [`notify::NotificationBus`].

pub mod api;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod intercept;
pub mod model;
pub mod notify;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;
