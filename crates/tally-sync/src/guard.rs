//! # Single-Flight Guard
//!
//! At most one run of a job at a time; a second caller is turned away
//! instead of queued.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tick ──► try_acquire() ── Some(guard) ──► run cycle ──► drop(guard)   │
//! │                 │                                        (flag reset)  │
//! │                 └───────── None ──► cycle in progress, tick dropped     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The flag is cleared in `Drop`, so a cycle that returns early with an
//! error (or panics) still releases it.

use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory "is a run in progress" flag.
#[derive(Debug)]
pub struct SingleFlight {
    name: &'static str,
    running: AtomicBool,
}

impl SingleFlight {
    /// Creates an idle guard. `name` is used in logs and errors.
    pub const fn new(name: &'static str) -> Self {
        SingleFlight {
            name,
            running: AtomicBool::new(false),
        }
    }

    /// Claims the flag, or returns `None` when a run is in progress.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Proof of holding a [`SingleFlight`]. Releases it when dropped.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let flight = SingleFlight::new("test job");
        let guard = flight.try_acquire();
        assert!(guard.is_some());
        assert!(flight.is_running());
        assert!(flight.try_acquire().is_none());

        drop(guard);
        assert!(!flight.is_running());
        assert!(flight.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_guard_released_on_early_return() {
        async fn job(flight: &SingleFlight) -> Result<(), &'static str> {
            let _guard = flight.try_acquire().ok_or("busy")?;
            Err("failed halfway")
        }

        let flight = SingleFlight::new("test job");
        assert_eq!(job(&flight).await, Err("failed halfway"));
        assert!(!flight.is_running());
    }
}
