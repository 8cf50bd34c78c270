//! Client notification bus: sync and cache status pushed to every open page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::clock::{Clock, SystemClock};

/// Message kinds understood by page clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
  SyncStart,
  SyncComplete,
  SyncError,
  SyncConflict,
  CacheInvalidated,
  CacheHit,
  CacheMiss,
  CacheUpdated,
  MutationQueued,
  DeadLetter,
}

/// `{ "type": ..., "timestamp": ..., "payload": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
  #[serde(rename = "type")]
  pub kind: MessageType,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
}

impl ClientMessage {
  pub fn to_json(&self) -> String {
    // Serializing plain data into a String cannot fail
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Broadcasts [`ClientMessage`]s to every subscribed client.
#[derive(Clone)]
pub struct NotificationBus {
  tx: broadcast::Sender<ClientMessage>,
  clock: Arc<dyn Clock>,
}

impl NotificationBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self {
      tx,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Attach a new client.
  pub fn subscribe(&self) -> ClientChannel {
    ClientChannel {
      rx: self.tx.subscribe(),
    }
  }

  /// Publish to all current clients; returns how many received it.
  pub fn publish(&self, kind: MessageType, payload: Option<Value>) -> usize {
    let message = ClientMessage {
      kind,
      timestamp: self.clock.now(),
      payload,
    };
    // No subscribers is fine: nobody is listening right now
    self.tx.send(message).unwrap_or(0)
  }
}

/// One client's view of the bus.
pub struct ClientChannel {
  rx: broadcast::Receiver<ClientMessage>,
}

impl ClientChannel {
  /// Receive the next message, skipping over any the client was too slow to read.
  pub async fn next(&mut self) -> Option<ClientMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Client fell behind the notification bus");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking receive of everything already published.
  pub fn drain(&mut self) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    loop {
      match self.rx.try_recv() {
        Ok(message) => messages.push(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => break,
      }
    }
    messages
  }
}
