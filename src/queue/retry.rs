//! Exponential backoff for queued mutations.

use chrono::Duration;

/// Retry schedule applied by `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Delay after the first failure
  pub base_delay: Duration,
  /// Upper bound for any single delay
  pub max_delay: Duration,
  /// Failures allowed before the item is dead-lettered
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::seconds(2),
      max_delay: Duration::minutes(5),
      max_attempts: 5,
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt once `attempts` failures have been recorded.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::zero();
    }
    let shift = (attempts - 1).min(30);
    let factor = 1i32 << shift;
    self
      .base_delay
      .checked_mul(factor)
      .map(|d| d.min(self.max_delay))
      .unwrap_or(self.max_delay)
  }

  /// Whether an item with `attempts` failures is exhausted.
  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_doubles_until_cap() {
    let policy = RetryPolicy {
      base_delay: Duration::seconds(1),
      max_delay: Duration::seconds(10),
      max_attempts: 5,
    };
    assert_eq!(policy.delay_for(0), Duration::zero());
    assert_eq!(policy.delay_for(1), Duration::seconds(1));
    assert_eq!(policy.delay_for(2), Duration::seconds(2));
    assert_eq!(policy.delay_for(4), Duration::seconds(8));
    assert_eq!(policy.delay_for(5), Duration::seconds(10));
    assert_eq!(policy.delay_for(60), Duration::seconds(10));
  }

  #[test]
  fn test_exhausted_at_max_attempts() {
    let policy = RetryPolicy::default();
    assert!(!policy.is_exhausted(4));
    assert!(policy.is_exhausted(5));
  }
}
