//! Cache interception: per-route strategies between pages and the network.
//!
//! - static assets: cache-first
//! - navigations: network-first with a short timeout
//! - read API: stale-while-revalidate
//! - write API: handed to the mutation engine

mod layer;
mod outcome;
mod route;

pub use layer::Interceptor;
pub use outcome::{FetchOutcome, ResponseSource};
pub use route::{is_reserved_store, read_cache_key, Route, RouteTable, PAGES_STORE, STATIC_STORE};
