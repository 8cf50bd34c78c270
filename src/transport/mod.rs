//! Network seam: every request leaving the sync layer goes through [`Transport`].

mod http;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;

use crate::error::NetworkError;

pub use http::HttpTransport;

/// Outgoing request, addressed by origin-relative path (query included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub path: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level page navigation rather than a subresource or API call
  pub navigate: bool,
}

impl Request {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      headers: Vec::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn navigate(path: impl Into<String>) -> Self {
    Self {
      navigate: true,
      ..Self::get(path)
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Path without the query string.
  pub fn path_only(&self) -> &str {
    self.path.split('?').next().unwrap_or(&self.path)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether the method changes server state.
  pub fn is_mutating(&self) -> bool {
    !self.method.is_safe()
  }
}

/// Response as seen by the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      content_type: None,
      body,
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self {
      status,
      content_type: Some("application/json".to_string()),
      body: value.to_string().into_bytes(),
    }
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Statuses worth retrying: the server may accept the same request later.
  pub fn is_transient_failure(&self) -> bool {
    matches!(self.status, 408 | 429) || self.status >= 500
  }
}

/// Something that can deliver a request to the origin server.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Send with a bounded timeout; exceeding it is a network failure.
pub async fn send_with_timeout(
  transport: &dyn Transport,
  request: &Request,
  timeout: Duration,
) -> Result<Response, NetworkError> {
  tokio::time::timeout(timeout, transport.send(request))
    .await
    .unwrap_or(Err(NetworkError::Timeout(timeout)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use fake::FakeTransport;

  #[test]
  fn test_request_helpers() {
    let request = Request::new(Method::PUT, "/api/attendance/S1?notify=1")
      .with_header("Idempotency-Key", "abc");
    assert_eq!(request.path_only(), "/api/attendance/S1");
    assert_eq!(request.header("idempotency-key"), Some("abc"));
    assert!(request.is_mutating());
    assert!(!Request::get("/api/students").is_mutating());
  }

  #[test]
  fn test_transient_statuses() {
    assert!(Response::new(503, Vec::new()).is_transient_failure());
    assert!(Response::new(429, Vec::new()).is_transient_failure());
    assert!(!Response::new(404, Vec::new()).is_transient_failure());
    assert!(!Response::new(200, Vec::new()).is_transient_failure());
  }

  #[tokio::test]
  async fn test_timeout_is_network_failure() {
    let transport = FakeTransport::new().with_latency(Duration::from_millis(200));
    let result = send_with_timeout(
      &transport,
      &Request::get("/api/students"),
      Duration::from_millis(10),
    )
    .await;
    assert_eq!(result, Err(NetworkError::Timeout(Duration::from_millis(10))));
  }
}
