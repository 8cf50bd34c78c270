//! Background sync: tagged drain cycles over the mutation queue.

mod coordinator;
mod monitor;
mod tags;

pub use coordinator::{CycleReport, SyncCoordinator};
pub use monitor::ConnectivityMonitor;
pub use tags::{SyncTags, DEFAULT_TAG};
