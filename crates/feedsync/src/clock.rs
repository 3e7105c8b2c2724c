//! Adaptive poll interval.
//!
//! The interval tightens while data flows, relaxes while the server keeps answering
//! "not modified", backs off exponentially on errors, and follows tab visibility and
//! connectivity. It always stays within `[min_interval, max_interval]`.

use std::time::Duration;

use crate::config::ClockConfig;

/// Exponent cap for the error backoff (32x base).
const MAX_ERROR_EXPONENT: u32 = 5;

/// How the last poll went, as far as cadence is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Success,
    NotModified,
    Error,
}

#[derive(Debug, Clone)]
pub struct AdaptiveClock {
    config: ClockConfig,
    interval: Duration,
    error_streak: u32,
    visible: bool,
    online: bool,
}

impl AdaptiveClock {
    pub fn new(config: ClockConfig) -> Self {
        let interval = config.base_interval();
        let mut clock = Self {
            config,
            interval,
            error_streak: 0,
            visible: true,
            online: true,
        };
        clock.interval = clock.clamp(interval);
        clock
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn error_streak(&self) -> u32 {
        self.error_streak
    }

    pub fn set_response_type(&mut self, response: ResponseType) {
        match response {
            ResponseType::Success => {
                self.error_streak = 0;
                self.scale(0.8);
            }
            ResponseType::NotModified => {
                self.error_streak = 0;
                self.scale(1.2);
            }
            ResponseType::Error => {
                self.error_streak = self.error_streak.saturating_add(1);
                let exp = self.error_streak.min(MAX_ERROR_EXPONENT);
                let backoff = self.config.base_interval().saturating_mul(1 << exp);
                self.set(backoff);
            }
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        if visible == self.visible {
            return;
        }
        self.visible = visible;
        self.scale(if visible { 0.5 } else { 2.0 });
    }

    pub fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;
        if online {
            self.scale(if self.visible { 0.7 } else { 1.5 });
        } else {
            self.interval = self.config.max_interval();
        }
    }

    pub fn reset(&mut self) {
        self.error_streak = 0;
        self.set(self.config.base_interval());
    }

    fn scale(&mut self, factor: f64) {
        self.set(self.interval.mul_f64(factor));
    }

    // Offline pins the interval at max until connectivity returns.
    fn set(&mut self, interval: Duration) {
        self.interval = if self.online {
            self.clamp(interval)
        } else {
            self.config.max_interval()
        };
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.config.min_interval(), self.config.max_interval())
    }
}
