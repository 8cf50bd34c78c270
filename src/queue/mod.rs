//! Mutation queue: immediate write attempts, durable queuing, retry policy.

mod engine;
mod retry;

pub use engine::{Delivery, MutationEngine, SubmitOutcome};
pub use retry::RetryPolicy;
