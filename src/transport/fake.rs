//! Scripted origin server for tests.
//!
//! Reads are answered from canned responses. Writes are applied at most once
//! per idempotency key, the way a well-behaved origin treats replays.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Request, Response, Transport};
use crate::error::NetworkError;

pub struct FakeTransport {
  online: AtomicBool,
  latency: Option<Duration>,
  routes: Mutex<HashMap<(Method, String), Response>>,
  scripted: Mutex<HashMap<(Method, String), VecDeque<Result<Response, NetworkError>>>>,
  requests: Mutex<Vec<Request>>,
  seen_keys: Mutex<HashSet<String>>,
  applied: Mutex<Vec<Request>>,
  active: AtomicUsize,
  peak: AtomicUsize,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      latency: None,
      routes: Mutex::new(HashMap::new()),
      scripted: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
      seen_keys: Mutex::new(HashSet::new()),
      applied: Mutex::new(Vec::new()),
      active: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Standing answer for a method and path.
  pub fn respond(&self, method: Method, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, path.to_string()), response);
  }

  /// One-shot answer consumed before the standing one.
  pub fn script(&self, method: Method, path: &str, result: Result<Response, NetworkError>) {
    self
      .scripted
      .lock()
      .unwrap()
      .entry((method, path.to_string()))
      .or_default()
      .push_back(result);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn count(&self, method: &Method, path: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| &r.method == method && r.path == path)
      .count()
  }

  /// Most requests ever outstanding at once.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn reset_peak(&self) {
    self.peak.store(0, Ordering::SeqCst);
  }

  /// Writes the server actually applied, in order.
  pub fn applied(&self) -> Vec<Request> {
    self.applied.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
    self.requests.lock().unwrap().push(request.clone());

    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(active, Ordering::SeqCst);
    let result = self.answer(request).await;
    self.active.fetch_sub(1, Ordering::SeqCst);
    result
  }
}

impl FakeTransport {
  async fn answer(&self, request: &Request) -> Result<Response, NetworkError> {
    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }
    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Connect("network unreachable".to_string()));
    }

    let route = (request.method.clone(), request.path.clone());
    let scripted = self
      .scripted
      .lock()
      .unwrap()
      .get_mut(&route)
      .and_then(|queue| queue.pop_front());
    if let Some(result) = scripted {
      return result;
    }

    if request.is_mutating() {
      let first_delivery = match request.header("Idempotency-Key") {
        Some(key) => self.seen_keys.lock().unwrap().insert(key.to_string()),
        None => true,
      };
      if first_delivery {
        self.applied.lock().unwrap().push(request.clone());
      }
      if let Some(response) = self.routes.lock().unwrap().get(&route) {
        return Ok(response.clone());
      }
      return Ok(Response::json(200, &serde_json::json!({"ok": true})));
    }

    match self.routes.lock().unwrap().get(&route) {
      Some(response) => Ok(response.clone()),
      None => Ok(Response::new(404, b"not found".to_vec())),
    }
  }
}
