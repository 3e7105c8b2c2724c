//! Reconnect state machine.
//!
//! All transport decisions go through [`TransportMachine::dispatch`]: it takes one
//! [`Signal`], updates the state, and returns the [`Directive`]s the session must
//! carry out. It performs no I/O and reads no clock, so every path is unit-testable.

use std::time::Duration;
use tokio::time::Instant;

use super::{Cadence, ConnectionState, Tier, TierSet};
use crate::config::ReconnectionConfig;
use crate::error::FeedError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Fresh attempt from the top tier with backoff cleared: first connect, manual
    /// reconnect, resume, watchdog.
    Connect,
    /// The server confirmed a push or stream subscription.
    Subscribed { tier: Tier, at: Instant },
    /// A poll came back (with or without data).
    PollSucceeded { at: Instant },
    /// Any inbound data or heartbeat.
    Activity { at: Instant },
    TierFailed { tier: Tier, reason: String },
    /// Paced retry: bumps backoff and schedules [`Signal::RetryDue`].
    Reconnect,
    RetryDue,
    WatchdogCheck { now: Instant },
    Hidden,
    Visible,
    Offline,
    Online,
    /// Explicit stop. Only [`Signal::Connect`] resumes.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Tear down the current link, in-flight poll, and subscribe timeout.
    Close,
    Open(Tier, Cadence),
    ScheduleRetry(Duration),
    CancelRetry,
}

#[derive(Debug)]
pub struct TransportMachine {
    config: ReconnectionConfig,
    watchdog_timeout: Duration,
    tiers: TierSet,
    state: ConnectionState,
    cadence: Cadence,
    backoff: u32,
    retry_pending: bool,
    last_heartbeat: Option<Instant>,
    hidden: bool,
    online: bool,
    halted: bool,
}

impl TransportMachine {
    pub fn new(config: ReconnectionConfig, watchdog_timeout: Duration, tiers: TierSet) -> Self {
        Self {
            config,
            watchdog_timeout,
            tiers,
            state: ConnectionState::Disconnected,
            cadence: Cadence::Fixed,
            backoff: 0,
            retry_pending: false,
            last_heartbeat: None,
            hidden: false,
            online: true,
            halted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn dispatch(&mut self, signal: Signal) -> Vec<Directive> {
        match signal {
            Signal::Connect => {
                self.halted = false;
                if let ConnectionState::Connecting(tier) = self.state {
                    tracing::debug!(%tier, "connect ignored, attempt in flight");
                    return Vec::new();
                }
                self.connect()
            }
            Signal::Subscribed { tier, at } => {
                if self.state != ConnectionState::Connecting(tier) {
                    return Vec::new();
                }
                self.mark_connected(tier, at);
                Vec::new()
            }
            Signal::PollSucceeded { at } => {
                match self.state {
                    ConnectionState::Connecting(Tier::Polling) => {
                        self.mark_connected(Tier::Polling, at)
                    }
                    ConnectionState::Connected(Tier::Polling) => self.last_heartbeat = Some(at),
                    _ => {}
                }
                Vec::new()
            }
            Signal::Activity { at } => {
                if self.state.tier().is_some() {
                    self.last_heartbeat = Some(at);
                }
                Vec::new()
            }
            Signal::TierFailed { tier, reason } => self.tier_failed(tier, reason),
            Signal::Reconnect => self.reconnect(),
            Signal::RetryDue => {
                if !self.retry_pending {
                    return Vec::new();
                }
                self.retry_pending = false;
                if !self.can_run() {
                    return Vec::new();
                }
                let tier = self.tiers.at_or_after(tier_for_backoff(self.backoff));
                tracing::info!(%tier, backoff = self.backoff, "retrying");
                self.open(tier, cadence_for(tier))
            }
            Signal::WatchdogCheck { now } => self.watchdog(now),
            Signal::Hidden => {
                self.hidden = true;
                self.suspend()
            }
            Signal::Visible => {
                self.hidden = false;
                self.resume()
            }
            Signal::Offline => {
                self.online = false;
                self.suspend()
            }
            Signal::Online => {
                self.online = true;
                self.resume()
            }
            Signal::Disconnect => {
                self.halted = true;
                self.suspend()
            }
        }
    }

    /// Delay before the next retry at the current backoff count.
    pub fn retry_delay(&self) -> Duration {
        let base = Duration::from_millis(self.config.initial_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        base.saturating_mul(1u32 << self.backoff.min(31)).min(max)
    }

    fn can_run(&self) -> bool {
        self.online && !self.hidden && !self.halted
    }

    fn connect(&mut self) -> Vec<Directive> {
        if !self.can_run() {
            return Vec::new();
        }
        self.backoff = 0;
        let mut out = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            out.push(Directive::CancelRetry);
        }
        let tier = self.tiers.at_or_after(Tier::Push);
        out.extend(self.open(tier, cadence_for(tier)));
        out
    }

    fn resume(&mut self) -> Vec<Directive> {
        if self.state == ConnectionState::Disconnected && !self.retry_pending {
            self.connect()
        } else {
            Vec::new()
        }
    }

    fn open(&mut self, tier: Tier, cadence: Cadence) -> Vec<Directive> {
        self.state = ConnectionState::Connecting(tier);
        self.cadence = cadence;
        vec![Directive::Close, Directive::Open(tier, cadence)]
    }

    fn mark_connected(&mut self, tier: Tier, at: Instant) {
        tracing::info!(%tier, "connected");
        self.state = ConnectionState::Connected(tier);
        self.backoff = 0;
        self.last_heartbeat = Some(at);
    }

    fn tier_failed(&mut self, tier: Tier, reason: String) -> Vec<Directive> {
        if self.state.tier() != Some(tier) {
            return Vec::new();
        }
        let degraded = FeedError::TransportDegraded { from: tier, reason };
        match self.tiers.after(tier) {
            Some(next) => {
                tracing::warn!(error = %degraded, to = %next, "falling back");
                // Polling behind a failed stream keeps the fixed period.
                let cadence = if tier == Tier::Stream {
                    Cadence::Fixed
                } else {
                    cadence_for(next)
                };
                self.open(next, cadence)
            }
            None => {
                tracing::warn!(error = %degraded, "last tier failed, scheduling retry");
                self.state = ConnectionState::Disconnected;
                let mut out = vec![Directive::Close];
                out.extend(self.reconnect());
                out
            }
        }
    }

    fn reconnect(&mut self) -> Vec<Directive> {
        if self.retry_pending || matches!(self.state, ConnectionState::Connecting(_)) {
            tracing::debug!("reconnect already in flight");
            return Vec::new();
        }
        if !self.can_run() {
            return Vec::new();
        }
        self.backoff = (self.backoff + 1).min(self.config.max_exponent);
        self.retry_pending = true;
        let delay = self.retry_delay();
        tracing::info!(backoff = self.backoff, ?delay, "reconnect scheduled");
        let mut out = Vec::new();
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            out.push(Directive::Close);
        }
        out.push(Directive::ScheduleRetry(delay));
        out
    }

    fn watchdog(&mut self, now: Instant) -> Vec<Directive> {
        let ConnectionState::Connected(Tier::Push | Tier::Stream) = self.state else {
            return Vec::new();
        };
        let Some(last) = self.last_heartbeat else {
            return Vec::new();
        };
        let silent_for = now.saturating_duration_since(last);
        if silent_for <= self.watchdog_timeout {
            return Vec::new();
        }
        tracing::warn!(error = %FeedError::WatchdogTimeout { silent_for }, "hard reconnect");
        self.connect()
    }

    fn suspend(&mut self) -> Vec<Directive> {
        let mut out = Vec::new();
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            out.push(Directive::Close);
        }
        if self.retry_pending {
            self.retry_pending = false;
            out.push(Directive::CancelRetry);
        }
        out
    }
}

fn cadence_for(tier: Tier) -> Cadence {
    match tier {
        Tier::Polling => Cadence::Adaptive,
        Tier::Push | Tier::Stream => Cadence::Fixed,
    }
}

/// Backoff count → preferred tier: 1 push, 2–3 stream, 4+ polling.
fn tier_for_backoff(backoff: u32) -> Tier {
    match backoff {
        0 | 1 => Tier::Push,
        2 | 3 => Tier::Stream,
        _ => Tier::Polling,
    }
}
