//! # Scheduling & Retry Policy
//!
//! Pure decisions the processor makes about queue items: in which order to
//! dispatch them, and what happens after a failed attempt.
//!
//! ## Dispatch Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sort key = (priority DESC, entity rank ASC, created_at ASC)            │
//! │                                                                         │
//! │   HIGH   customer     09:00 ─┐                                          │
//! │   HIGH   transaction  08:55  │  customers always lead their tier so a   │
//! │   NORMAL customer     09:10  │  transaction finds its owner already     │
//! │   NORMAL transaction  09:05  │  synced within the same batch            │
//! │   NORMAL rental       08:00 ─┘                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  attempt fails with retry_count = n (before this failure)               │
//! │       │                                                                 │
//! │       ├── non-retryable ─────────────────────► FAILED (count n+1)       │
//! │       ├── n >= max_attempts ─────────────────► FAILED (count n+1)       │
//! │       └── otherwise ─► RETRY at now + base × 2^n  (count n+1)           │
//! │                                                                         │
//! │  max_attempts = 3, base = 1 min:  1 min, 2 min, 4 min, then FAILED      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;

use crate::types::SyncQueueItem;

/// Default number of retryable failures before an item goes FAILED.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Cap on the backoff exponent so the delay arithmetic cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

// =============================================================================
// Dispatch Ordering
// =============================================================================

/// Sort key for a queue item. Smaller keys are dispatched first.
pub fn dispatch_key(item: &SyncQueueItem) -> (Reverse<i64>, i64, DateTime<Utc>) {
    (
        Reverse(item.priority.rank()),
        item.entity_type.rank(),
        item.created_at,
    )
}

/// Sorts a batch into dispatch order in place.
///
/// The store already returns rows in this order; sorting again keeps the
/// invariant independent of how a batch was assembled.
pub fn sort_for_dispatch(items: &mut [SyncQueueItem]) {
    items.sort_by_key(dispatch_key);
}

// =============================================================================
// Retry Policy
// =============================================================================

/// What to do with an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Try again once `scheduled_for` has passed.
    Retry {
        retry_count: i64,
        scheduled_for: DateTime<Utc>,
    },
    /// Terminal. Only a manual bulk retry brings the item back.
    Failed { retry_count: i64 },
}

impl FailureOutcome {
    pub fn retry_count(&self) -> i64 {
        match self {
            FailureOutcome::Retry { retry_count, .. } => *retry_count,
            FailureOutcome::Failed { retry_count } => *retry_count,
        }
    }
}

/// Exponential backoff with a terminal attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::minutes(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a one-minute base delay.
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before the next attempt when `retry_count` failures preceded it.
    ///
    /// ## Example
    /// ```rust
    /// use chrono::Duration;
    /// use tally_core::policy::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_delay(0), Duration::minutes(1));
    /// assert_eq!(policy.backoff_delay(2), Duration::minutes(4));
    /// ```
    pub fn backoff_delay(&self, retry_count: i64) -> Duration {
        let exponent = retry_count.clamp(0, MAX_BACKOFF_EXPONENT as i64) as u32;
        self.base_delay * 2_i32.pow(exponent)
    }

    /// Decides the next state after a failed attempt.
    ///
    /// ## Arguments
    /// * `retry_count` - the item's count before this failure
    /// * `retryable` - classification carried by the error
    /// * `now` - the failure time
    pub fn on_failure(&self, retry_count: i64, retryable: bool, now: DateTime<Utc>) -> FailureOutcome {
        let next_count = retry_count + 1;

        if !retryable || retry_count >= self.max_attempts as i64 {
            return FailureOutcome::Failed {
                retry_count: next_count,
            };
        }

        FailureOutcome::Retry {
            retry_count: next_count,
            scheduled_for: now + self.backoff_delay(retry_count),
        }
    }
}

/// PROCESSING items last touched before this instant are presumed abandoned.
pub fn stuck_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now - threshold
}

// =============================================================================
// Unit Tests
// =============================================================================
