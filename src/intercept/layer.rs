//! Interception layer that picks a caching strategy per request.

use chrono::Duration;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::outcome::{FetchOutcome, ResponseSource};
use super::route::{read_cache_key, Route, RouteTable, PAGES_STORE, STATIC_STORE};
use crate::api::{ApiTarget, COLLECTION_REF};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::model::{CacheEntry, Operation};
use crate::notify::{MessageType, NotificationBus};
use crate::queue::{MutationEngine, SubmitOutcome};
use crate::store::DurableStore;
use crate::transport::{send_with_timeout, Request, Response, Transport};

/// Served when a page or asset is unavailable and no fallback was cached.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page has not been saved for offline use. \
Your changes are kept and will sync when the connection returns.</p></body></html>\n";

/// Sits between pages and the network, serving from the durable cache when it can.
///
/// Cloning is cheap; background revalidation runs on a clone.
#[derive(Clone)]
pub struct Interceptor {
  store: Arc<dyn DurableStore>,
  transport: Arc<dyn Transport>,
  engine: Arc<MutationEngine>,
  bus: NotificationBus,
  clock: Arc<dyn Clock>,
  routes: Arc<RouteTable>,
  ttls: Arc<HashMap<String, Duration>>,
  default_ttl: Option<Duration>,
  request_timeout: std::time::Duration,
  navigation_timeout: std::time::Duration,
  offline_fallback: Option<String>,
}

impl Interceptor {
  pub fn new(
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    engine: Arc<MutationEngine>,
    bus: NotificationBus,
    routes: RouteTable,
  ) -> Self {
    Self {
      store,
      transport,
      engine,
      bus,
      clock: Arc::new(SystemClock),
      routes: Arc::new(routes),
      ttls: Arc::new(HashMap::new()),
      default_ttl: Some(Duration::minutes(5)),
      request_timeout: std::time::Duration::from_secs(10),
      navigation_timeout: std::time::Duration::from_secs(3),
      offline_fallback: None,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// TTL for read API entries of one store.
  pub fn with_ttl(mut self, store_name: &str, ttl: Duration) -> Self {
    Arc::make_mut(&mut self.ttls).insert(store_name.to_string(), ttl);
    self
  }

  /// TTL for read API stores without their own.
  pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_timeouts(
    mut self,
    request: std::time::Duration,
    navigation: std::time::Duration,
  ) -> Self {
    self.request_timeout = request;
    self.navigation_timeout = navigation;
    self
  }

  /// Path of a cached page served when a navigation or asset is unavailable.
  pub fn with_offline_fallback(mut self, path: Option<String>) -> Self {
    self.offline_fallback = path;
    self
  }

  pub fn routes(&self) -> &RouteTable {
    &self.routes
  }

  /// Serve one request.
  pub async fn handle(&self, request: Request) -> StoreResult<FetchOutcome> {
    let Some(route) = self.routes.classify(&request) else {
      debug!(method = %request.method, path = %request.path, "Not intercepted");
      return Ok(self.passthrough(&request).await);
    };

    match route {
      Route::Static => self.cache_first(&request).await,
      Route::Navigation => self.network_first(&request).await,
      Route::ReadApi(target) => self.stale_while_revalidate(&request, &target).await,
      Route::WriteApi(target) => self.write(&request, &target).await,
    }
  }

  /// Fetch and cache static assets and pages ahead of time. Returns how many were stored.
  pub async fn precache(&self, paths: &[String]) -> StoreResult<usize> {
    let mut stored = 0;

    for path in paths {
      let (request, store_name) = match self.routes.classify(&Request::get(path.clone())) {
        Some(Route::Static) => (Request::get(path.clone()), STATIC_STORE),
        Some(Route::Navigation) => (Request::navigate(path.clone()), PAGES_STORE),
        _ => {
          warn!(path = %path, "Not a static or page route, skipping precache");
          continue;
        }
      };
      let key = cache_key_for(&request, store_name);

      match self.fetch(&request, self.request_timeout).await {
        Ok(response) if response.is_success() => {
          self.put_with_eviction(&self.entry_for(store_name, key, None, &response, None))?;
          stored += 1;
        }
        Ok(response) => warn!(path = %path, status = response.status, "Precache fetch refused"),
        Err(reason) => warn!(path = %path, %reason, "Precache fetch failed"),
      }
    }

    debug!(stored, requested = paths.len(), "Precache finished");
    Ok(stored)
  }

  /// Upsert, evicting least-recently-used entries once if the store is full.
  pub fn put_with_eviction(&self, entry: &CacheEntry) -> StoreResult<()> {
    match self.store.put(entry) {
      Err(StoreError::QuotaExceeded { .. }) => {
        let evicted = self.store.evict_lru(entry)?;
        debug!(store = %entry.store_name, evicted, "Evicted entries to make room");
        self.store.put(entry)
      }
      other => other,
    }
  }

  async fn cache_first(&self, request: &Request) -> StoreResult<FetchOutcome> {
    let key = cache_key_for(request, STATIC_STORE);

    if let Some(entry) = self.store.get(STATIC_STORE, &key)? {
      self.publish_lookup(MessageType::CacheHit, STATIC_STORE, &key, request, false);
      return Ok(FetchOutcome::from_cache(entry, ResponseSource::CacheFresh));
    }
    self.publish_lookup(MessageType::CacheMiss, STATIC_STORE, &key, request, false);

    match self.fetch(request, self.request_timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.put_with_eviction(&self.entry_for(STATIC_STORE, key, None, &response, None))?;
        }
        Ok(FetchOutcome::from_network(response))
      }
      Err(reason) => {
        debug!(path = %request.path, %reason, "Asset unavailable");
        self.offline_fallback()
      }
    }
  }

  async fn network_first(&self, request: &Request) -> StoreResult<FetchOutcome> {
    let key = cache_key_for(request, PAGES_STORE);

    match self.fetch(request, self.navigation_timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.put_with_eviction(&self.entry_for(PAGES_STORE, key, None, &response, None))?;
        }
        Ok(FetchOutcome::from_network(response))
      }
      Err(reason) => {
        debug!(path = %request.path, %reason, "Navigation falling back to cache");
        match self.store.get(PAGES_STORE, &key)? {
          Some(entry) => {
            self.publish_lookup(MessageType::CacheHit, PAGES_STORE, &key, request, true);
            Ok(FetchOutcome::from_cache(entry, ResponseSource::Offline))
          }
          None => {
            self.publish_lookup(MessageType::CacheMiss, PAGES_STORE, &key, request, false);
            self.offline_fallback()
          }
        }
      }
    }
  }

  async fn stale_while_revalidate(
    &self,
    request: &Request,
    target: &ApiTarget,
  ) -> StoreResult<FetchOutcome> {
    let store_name = target.store_name.as_str();
    let key = read_cache_key(request, target);
    let entity_ref = target
      .entity_id
      .clone()
      .unwrap_or_else(|| COLLECTION_REF.to_string());

    let Some(entry) = self.store.get(store_name, &key)? else {
      self.publish_lookup(MessageType::CacheMiss, store_name, &key, request, false);
      return match self.fetch(request, self.request_timeout).await {
        Ok(response) => {
          if response.is_success() {
            self.store_read(store_name, &key, &entity_ref, &response)?;
          }
          Ok(FetchOutcome::from_network(response))
        }
        Err(reason) => {
          debug!(path = %request.path, %reason, "Read unavailable");
          Ok(FetchOutcome::Unavailable)
        }
      };
    };

    if !entry.is_stale(self.clock.now()) {
      self.publish_lookup(MessageType::CacheHit, store_name, &key, request, false);
      self.spawn_refresh(
        request.clone(),
        store_name.to_string(),
        key,
        entity_ref,
        entry.payload.clone(),
      );
      return Ok(FetchOutcome::from_cache(entry, ResponseSource::CacheFresh));
    }

    // Past its TTL: only trusted if the network cannot answer
    self.publish_lookup(MessageType::CacheHit, store_name, &key, request, true);
    match self.fetch(request, self.request_timeout).await {
      Ok(response) if response.is_success() => {
        let changed = response.body != entry.payload;
        self.store_read(store_name, &key, &entity_ref, &response)?;
        if changed {
          self.publish_updated(store_name, &key, request);
        }
        Ok(FetchOutcome::from_network(response))
      }
      Ok(response) => {
        if matches!(response.status, 404 | 410) {
          self.store.invalidate(store_name, &key)?;
        }
        Ok(FetchOutcome::from_network(response))
      }
      Err(reason) => {
        debug!(path = %request.path, %reason, "Revalidation failed, serving stale entry");
        Ok(FetchOutcome::from_cache(entry, ResponseSource::CacheStale))
      }
    }
  }

  fn spawn_refresh(
    &self,
    request: Request,
    store_name: String,
    key: String,
    entity_ref: String,
    previous: Vec<u8>,
  ) {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(e) = this
        .refresh(&request, &store_name, &key, &entity_ref, &previous)
        .await
      {
        warn!(path = %request.path, "Background refresh failed: {}", e);
      }
    });
  }

  async fn refresh(
    &self,
    request: &Request,
    store_name: &str,
    key: &str,
    entity_ref: &str,
    previous: &[u8],
  ) -> StoreResult<()> {
    let response = match self.fetch(request, self.request_timeout).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        debug!(path = %request.path, status = response.status, "Refresh not applied");
        return Ok(());
      }
      Err(reason) => {
        debug!(path = %request.path, %reason, "Refresh skipped");
        return Ok(());
      }
    };

    self.store_read(store_name, key, entity_ref, &response)?;
    if response.body != previous {
      self.publish_updated(store_name, key, request);
    }
    Ok(())
  }

  async fn write(&self, request: &Request, target: &ApiTarget) -> StoreResult<FetchOutcome> {
    let layout = self.routes.layout();
    let operation = match request.method {
      Method::POST if target.entity_id.is_none() => Operation::Create,
      Method::PUT | Method::PATCH => Operation::Update,
      Method::DELETE => Operation::Delete,
      _ => return Ok(self.passthrough(request).await),
    };

    let payload = match request.body.as_deref() {
      None | Some([]) => Value::Null,
      Some(body) => match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(_) => {
          debug!(path = %request.path, "Write body is not JSON, not queueable");
          return Ok(self.passthrough(request).await);
        }
      },
    };

    let entity_id = target
      .entity_id
      .clone()
      .or_else(|| layout.entity_id_in(&target.store_name, &payload));
    if operation != Operation::Create && entity_id.is_none() {
      return Ok(self.passthrough(request).await);
    }

    let outcome = self
      .engine
      .submit_for(operation, &target.store_name, entity_id, payload)
      .await?;
    Ok(match outcome {
      SubmitOutcome::Synced(response) => FetchOutcome::from_network(response),
      SubmitOutcome::Queued { id } => FetchOutcome::Queued { id },
      SubmitOutcome::Rejected(response) => FetchOutcome::Rejected(response),
    })
  }

  fn offline_fallback(&self) -> StoreResult<FetchOutcome> {
    if let Some(path) = &self.offline_fallback {
      for store_name in [PAGES_STORE, STATIC_STORE] {
        if let Some(entry) = self.store.get(store_name, path)? {
          return Ok(FetchOutcome::from_cache(entry, ResponseSource::Fallback));
        }
      }
    }

    Ok(FetchOutcome::Response {
      response: Response::new(503, OFFLINE_PAGE.as_bytes().to_vec())
        .with_content_type("text/html; charset=utf-8"),
      source: ResponseSource::Fallback,
    })
  }

  async fn passthrough(&self, request: &Request) -> FetchOutcome {
    FetchOutcome::Passthrough(
      send_with_timeout(self.transport.as_ref(), request, self.request_timeout).await,
    )
  }

  /// Network answer, or the reason there was none. Retryable statuses count as no answer.
  async fn fetch(
    &self,
    request: &Request,
    timeout: std::time::Duration,
  ) -> Result<Response, String> {
    match send_with_timeout(self.transport.as_ref(), request, timeout).await {
      Ok(response) if response.is_transient_failure() => Err(format!("HTTP {}", response.status)),
      Ok(response) => Ok(response),
      Err(e) => Err(e.to_string()),
    }
  }

  fn store_read(
    &self,
    store_name: &str,
    key: &str,
    entity_ref: &str,
    response: &Response,
  ) -> StoreResult<()> {
    let ttl = self.ttls.get(store_name).copied().or(self.default_ttl);
    let entry = self.entry_for(store_name, key.to_string(), Some(entity_ref), response, ttl);
    self.put_with_eviction(&entry)
  }

  fn entry_for(
    &self,
    store_name: &str,
    key: String,
    entity_ref: Option<&str>,
    response: &Response,
    ttl: Option<Duration>,
  ) -> CacheEntry {
    CacheEntry::new(store_name, key, response.body.clone(), self.clock.now())
      .with_content_type(response.content_type.clone())
      .with_entity_ref(entity_ref.map(str::to_string))
      .with_ttl(ttl)
  }

  fn publish_lookup(
    &self,
    kind: MessageType,
    store_name: &str,
    key: &str,
    request: &Request,
    stale: bool,
  ) {
    self.bus.publish(
      kind,
      Some(json!({
        "store": store_name,
        "key": key,
        "path": request.path,
        "stale": stale,
      })),
    );
  }

  fn publish_updated(&self, store_name: &str, key: &str, request: &Request) {
    debug!(store = store_name, key, "Cached read refreshed");
    self.bus.publish(
      MessageType::CacheUpdated,
      Some(json!({
        "store": store_name,
        "key": key,
        "path": request.path,
      })),
    );
  }
}

/// Assets keep their query (versioned URLs); pages do not.
fn cache_key_for(request: &Request, store_name: &str) -> String {
  if store_name == PAGES_STORE {
    request.path_only().to_string()
  } else {
    request.path.clone()
  }
}
