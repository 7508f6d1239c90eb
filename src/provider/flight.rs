//! In-flight generation tracking for drain-before-cleanup.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum DrainError {
    #[error("Drain timed out with {remaining} generation(s) in flight")]
    Timeout { remaining: u32 },
}

/// Counts generations running against one provider.
pub struct FlightTracker {
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Increment the in-flight count (returns RAII guard).
    pub fn track(&self) -> FlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        FlightGuard {
            counter: self.in_flight.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until the in-flight count reaches zero (with timeout).
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            let count = self.in_flight_count();
            if count == 0 {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.in_flight_count();
                    if remaining == 0 {
                        return Ok(());
                    }
                    return Err(DrainError::Timeout { remaining });
                }
            }
        }
    }
}

impl Default for FlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight count on drop.
pub struct FlightGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}
