//! Shared fixture for component tests: in-memory store, manual clock and a scripted origin.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::ApiLayout;
use crate::clock::ManualClock;
use crate::notify::NotificationBus;
use crate::queue::{MutationEngine, RetryPolicy};
use crate::store::{SqliteStore, StoreQuota};
use crate::sync::SyncTags;
use crate::transport::fake::FakeTransport;

pub struct Harness {
  pub clock: Arc<ManualClock>,
  pub store: Arc<SqliteStore>,
  pub transport: Arc<FakeTransport>,
  pub bus: NotificationBus,
  pub layout: ApiLayout,
  pub tags: SyncTags,
}

/// A start time without sub-millisecond precision, so stored timestamps compare equal.
pub fn start_time() -> DateTime<Utc> {
  DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub fn retry_policy() -> RetryPolicy {
  RetryPolicy {
    base_delay: Duration::seconds(1),
    max_delay: Duration::seconds(30),
    max_attempts: 5,
  }
}

impl Harness {
  pub fn new() -> Self {
    Self::with_quotas(&[])
  }

  pub fn with_quotas(quotas: &[(&str, StoreQuota)]) -> Self {
    Self::build(FakeTransport::new(), quotas)
  }

  pub fn with_transport(transport: FakeTransport) -> Self {
    Self::build(transport, &[])
  }

  fn build(transport: FakeTransport, quotas: &[(&str, StoreQuota)]) -> Self {
    let clock = Arc::new(ManualClock::new(start_time()));
    let mut store = SqliteStore::open_in_memory()
      .unwrap()
      .with_clock(clock.clone())
      .with_retry_policy(retry_policy());
    for (name, quota) in quotas {
      store = store.with_quota(*name, *quota);
    }

    Self {
      bus: NotificationBus::new(256).with_clock(clock.clone()),
      clock,
      store: Arc::new(store),
      transport: Arc::new(transport),
      layout: ApiLayout::new("/api").with_key_field("attendance", "studentId"),
      tags: SyncTags::new(BTreeMap::from([(
        "teacher-portal".to_string(),
        vec!["attendance".to_string(), "grades".to_string()],
      )])),
    }
  }

  pub fn engine(&self) -> Arc<MutationEngine> {
    Arc::new(
      MutationEngine::new(
        self.store.clone(),
        self.transport.clone(),
        self.bus.clone(),
        self.layout.clone(),
      )
      .with_clock(self.clock.clone())
      .with_tags(self.tags.clone())
      .with_timeout(std::time::Duration::from_secs(5)),
    )
  }
}
