use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::transport::{send_with_timeout, Request, Transport};

/// Decides whether the origin is reachable by probing a health path.
pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  health_path: String,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityMonitor {
  pub fn new(transport: Arc<dyn Transport>, health_path: impl Into<String>) -> Self {
    Self {
      transport,
      health_path: health_path.into(),
      interval: Duration::from_secs(15),
      timeout: Duration::from_secs(5),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Any answer below 500 means the origin is up, even if the path itself is missing.
  pub async fn probe(&self) -> bool {
    let request = Request::get(self.health_path.clone());
    match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
      Ok(response) => response.status < 500,
      Err(e) => {
        debug!("Health probe failed: {}", e);
        false
      }
    }
  }
}
