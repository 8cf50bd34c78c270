//! Wires every component from configuration.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::ApiLayout;
use crate::config::Config;
use crate::conflict::ConflictResolver;
use crate::intercept::{Interceptor, RouteTable};
use crate::notify::NotificationBus;
use crate::queue::MutationEngine;
use crate::store::{DurableStore, SqliteStore};
use crate::sync::{ConnectivityMonitor, SyncCoordinator, SyncTags};
use crate::transport::{HttpTransport, Transport};

pub struct Runtime {
  pub store: Arc<SqliteStore>,
  pub bus: NotificationBus,
  pub engine: Arc<MutationEngine>,
  pub coordinator: Arc<SyncCoordinator>,
  pub interceptor: Interceptor,
  pub monitor: ConnectivityMonitor,
}

impl Runtime {
  pub fn from_config(config: &Config) -> Result<Self> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config)?);
    let db_path = config.storage.database_path()?;
    let store = Self::open_store(config, &db_path)?;
    info!(path = %db_path.display(), "Opened sync database");
    Ok(Self::assemble(config, Arc::new(store), transport))
  }

  fn open_store(config: &Config, path: &std::path::Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?
      .with_retry_policy(config.retry.policy())
      .with_lease(chrono::Duration::seconds(config.retry.lease_secs as i64));

    for (name, store_config) in &config.stores {
      if let Some(quota) = store_config.quota() {
        store = store.with_quota(name.clone(), quota);
      }
    }
    Ok(store)
  }

  /// Build the components over an already-open store and transport.
  pub fn assemble(
    config: &Config,
    store: Arc<SqliteStore>,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let shared: Arc<dyn DurableStore> = store.clone();
    let bus = NotificationBus::new(config.sync.bus_capacity);
    let layout = Self::layout(config);
    let tags = SyncTags::new(config.sync.tags.clone());
    let request_timeout = Duration::from_millis(config.server.request_timeout_ms);

    let engine = Arc::new(
      MutationEngine::new(shared.clone(), transport.clone(), bus.clone(), layout.clone())
        .with_tags(tags.clone())
        .with_timeout(request_timeout),
    );

    let mut resolver = ConflictResolver::new();
    for (name, store_config) in &config.stores {
      resolver.register(name, store_config.conflict.comparator());
    }

    let coordinator = Arc::new(
      SyncCoordinator::new(shared.clone(), engine.clone(), resolver, bus.clone(), tags)
        .with_concurrency(config.sync.concurrency),
    );

    let routes = RouteTable::new(
      layout,
      config.intercept.static_prefixes.clone(),
      config.intercept.navigation_routes.clone(),
    );
    let default_ttl = match config.intercept.read_ttl_secs {
      0 => None,
      secs => Some(chrono::Duration::seconds(secs as i64)),
    };
    let mut interceptor = Interceptor::new(
      shared,
      transport.clone(),
      engine.clone(),
      bus.clone(),
      routes,
    )
    .with_default_ttl(default_ttl)
    .with_timeouts(
      request_timeout,
      Duration::from_millis(config.server.navigation_timeout_ms),
    )
    .with_offline_fallback(config.intercept.offline_fallback.clone());
    for (name, store_config) in &config.stores {
      if let Some(secs) = store_config.ttl_secs {
        interceptor = interceptor.with_ttl(name, chrono::Duration::seconds(secs as i64));
      }
    }

    let monitor = ConnectivityMonitor::new(transport, config.server.health_path.clone())
      .with_interval(Duration::from_secs(config.sync.probe_interval_secs.max(1)))
      .with_timeout(request_timeout);

    Self {
      store,
      bus,
      engine,
      coordinator,
      interceptor,
      monitor,
    }
  }

  fn layout(config: &Config) -> ApiLayout {
    let mut layout = ApiLayout::new(&config.intercept.api_prefix);
    for (name, store_config) in &config.stores {
      if let Some(field) = &store_config.key_field {
        layout = layout.with_key_field(name, field);
      }
      if let Some(field) = &store_config.version_field {
        layout = layout.with_version_field(name, field);
      }
    }
    layout
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::intercept::FetchOutcome;
  use crate::model::Operation;
  use crate::queue::SubmitOutcome;
  use crate::transport::fake::FakeTransport;
  use crate::transport::Request;
  use reqwest::Method;
  use serde_json::json;

  #[tokio::test]
  async fn test_assembled_components_share_one_queue() {
    let config = Config::parse(
      r#"
server:
  base_url: https://lxp.example.edu
stores:
  attendance:
    key_field: studentId
sync:
  tags:
    teacher-portal: [attendance]
"#,
    )
    .unwrap();
    let transport = Arc::new(FakeTransport::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runtime = Runtime::assemble(&config, store, transport.clone());

    transport.set_online(false);
    let outcome = runtime
      .interceptor
      .handle(
        Request::new(Method::PUT, "/api/attendance/S1")
          .with_body(br#"{"studentId":"S1","status":"present"}"#.to_vec()),
      )
      .await
      .unwrap();
    assert!(matches!(outcome, FetchOutcome::Queued { .. }));

    let direct = runtime
      .engine
      .submit(Operation::Update, "attendance", json!({"studentId": "S1", "status": "late"}))
      .await
      .unwrap();
    assert!(matches!(direct, SubmitOutcome::Queued { .. }));

    assert_eq!(
      runtime.coordinator.registered_tags().unwrap(),
      vec!["teacher-portal"]
    );

    transport.set_online(true);
    let reports = runtime.coordinator.fire_all().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].synced, 2);
    assert_eq!(runtime.store.queue_counts().unwrap().outstanding(), 0);
  }
}
