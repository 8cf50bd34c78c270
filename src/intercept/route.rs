//! Request classification and cache keys.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::api::{ApiLayout, ApiTarget};
use crate::transport::Request;

/// Cache partition for static assets.
pub const STATIC_STORE: &str = "static";
/// Cache partition for navigations.
pub const PAGES_STORE: &str = "pages";

/// How an intercepted request is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  /// Cache-first
  Static,
  /// Network-first with a short timeout
  Navigation,
  /// Stale-while-revalidate
  ReadApi(ApiTarget),
  /// Handed to the mutation engine
  WriteApi(ApiTarget),
}

/// Allow-list of intercepted paths. Anything it does not classify passes through.
#[derive(Debug, Clone)]
pub struct RouteTable {
  layout: ApiLayout,
  static_prefixes: Vec<String>,
  navigation_routes: Vec<String>,
}

impl RouteTable {
  pub fn new(
    layout: ApiLayout,
    static_prefixes: Vec<String>,
    navigation_routes: Vec<String>,
  ) -> Self {
    Self {
      layout,
      static_prefixes,
      navigation_routes,
    }
  }

  pub fn layout(&self) -> &ApiLayout {
    &self.layout
  }

  pub fn classify(&self, request: &Request) -> Option<Route> {
    let path = request.path_only();

    if self.layout.is_api_path(path) {
      let target = self.layout.parse(path)?;
      // Those names are taken by the page and asset partitions
      if is_reserved_store(&target.store_name) {
        return None;
      }
      return if request.method == Method::GET {
        Some(Route::ReadApi(target))
      } else if request.is_mutating() {
        Some(Route::WriteApi(target))
      } else {
        None
      };
    }

    if request.method != Method::GET {
      return None;
    }
    if self
      .navigation_routes
      .iter()
      .any(|route| matches_route(route, path))
    {
      return Some(Route::Navigation);
    }
    if self
      .static_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return Some(Route::Static);
    }
    None
  }
}

/// Store names the interceptor keeps for its own partitions.
pub fn is_reserved_store(store_name: &str) -> bool {
  store_name == STATIC_STORE || store_name == PAGES_STORE
}

/// `/` matches only itself; other routes also match their subpaths.
fn matches_route(route: &str, path: &str) -> bool {
  let route = route.trim_end_matches('/');
  if route.is_empty() {
    return path == "/";
  }
  path == route || path.starts_with(&format!("{}/", route))
}

/// Cache key for a read API response. A plain entity read is keyed by the
/// entity id so writes can invalidate it; anything else by a hash of the
/// normalized path and query.
pub fn read_cache_key(request: &Request, target: &ApiTarget) -> String {
  match (&target.entity_id, query_of(&request.path)) {
    (Some(entity_id), None) => entity_id.clone(),
    _ => hash_key(&normalize(&request.path)),
  }
}

fn query_of(path: &str) -> Option<&str> {
  path
    .split_once('?')
    .map(|(_, query)| query)
    .filter(|query| !query.is_empty())
}

/// Trailing slash dropped and query parameters sorted, so equivalent URLs share a key.
fn normalize(path: &str) -> String {
  let base = path.split('?').next().unwrap_or(path);
  let base = match base.trim_end_matches('/') {
    "" => "/",
    trimmed => trimmed,
  };

  let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query_of(path).unwrap_or("").as_bytes())
    .into_owned()
    .collect();
  pairs.sort();

  if pairs.is_empty() {
    return base.to_string();
  }
  let query = form_urlencoded::Serializer::new(String::new())
    .extend_pairs(pairs)
    .finish();
  format!("{}?{}", base, query)
}

fn hash_key(input: &str) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
