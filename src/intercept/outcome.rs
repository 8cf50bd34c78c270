//! What the interception layer hands back to the page.

use serde::Serialize;
use uuid::Uuid;

use crate::error::NetworkError;
use crate::model::CacheEntry;
use crate::transport::Response;

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// From cache, within its TTL
  CacheFresh,
  /// From cache past its TTL, because revalidation failed
  CacheStale,
  /// Network unavailable, serving the last cached page
  Offline,
  /// Offline fallback page
  Fallback,
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  Response {
    response: Response,
    source: ResponseSource,
  },
  /// Write accepted locally and queued for background sync
  Queued { id: Uuid },
  /// Write refused by the server
  Rejected(Response),
  /// Read failed on both network and cache
  Unavailable,
  /// Not intercepted; the network's answer as-is
  Passthrough(Result<Response, NetworkError>),
}

impl FetchOutcome {
  pub fn from_network(response: Response) -> Self {
    Self::Response {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(entry: CacheEntry, source: ResponseSource) -> Self {
    let response = Response {
      status: 200,
      content_type: entry.content_type,
      body: entry.payload,
    };
    Self::Response { response, source }
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Response { response, .. } | Self::Rejected(response) => Some(response),
      Self::Passthrough(Ok(response)) => Some(response),
      _ => None,
    }
  }

  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      Self::Response { source, .. } => Some(*source),
      _ => None,
    }
  }
}
