//! Cancellable one-shot timers on tokio's clock.
//!
//! A [`Timer`] holds at most one deadline. Arming replaces the previous deadline, so a
//! timer can never fire twice for one concern. Under `tokio::time::pause` the timers
//! follow the virtual clock.

use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deadline: None,
        }
    }

    /// Fire `after` from now, dropping any earlier schedule.
    pub fn arm(&mut self, after: Duration) {
        self.arm_at(Instant::now() + after);
    }

    pub fn arm_at(&mut self, at: Instant) {
        tracing::trace!(timer = self.name, ?at, "armed");
        self.deadline = Some(at);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the deadline passes and disarms the timer. Pending forever
    /// while disarmed, which makes it safe as a `tokio::select!` branch.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(at) => {
                sleep_until(at).await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}
