//! Feed engine configuration.
//!
//! Every section has a `Default` carrying the production values; all durations
//! are milliseconds so a JSON file can override any subset of them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one feed session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Where the HTTP source finds the API, stream, and push channel.
    pub endpoints: EndpointConfig,
    /// Items requested per delta poll and per older page.
    pub page_limit: usize,
    /// Timeout applied to every fetch.
    pub request_timeout_ms: u64,
    /// How long a push/stream tier may take to confirm its subscription.
    pub subscribe_timeout_ms: u64,
    /// Fixed poll period used when the stream tier falls back to polling.
    pub poll_period_ms: u64,
    pub buffer: BufferConfig,
    pub clock: ClockConfig,
    pub reconnection: ReconnectionConfig,
    pub watchdog: WatchdogConfig,
}

impl FeedConfig {
    /// Load from a JSON file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            page_limit: 50,
            request_timeout_ms: 10_000,
            subscribe_timeout_ms: 10_000,
            poll_period_ms: 5_000,
            buffer: BufferConfig::default(),
            clock: ClockConfig::default(),
            reconnection: ReconnectionConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// HTTP endpoints of the news API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:3000`.
    pub api_base: String,
    /// List route answering `?after=` and `?cursor=` queries.
    pub items_path: String,
    /// Server-sent event route; `None` disables the stream tier.
    pub stream_path: Option<String>,
    /// WebSocket URL of the insert notifications; `None` disables the push tier.
    pub push_url: Option<String>,
    /// Topic sent in the push subscribe frame.
    pub push_topic: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".into(),
            items_path: "/api/news".into(),
            stream_path: Some("/api/news/stream".into()),
            push_url: None,
            push_topic: "news".into(),
        }
    }
}

/// Staging buffer limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Staged count at which the "new items" banner shows.
    pub threshold: usize,
    pub max_buffer: usize,
    pub max_visible: usize,
    /// Debounce window for arrivals.
    pub batch_window_ms: u64,
}

impl BufferConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            max_buffer: 200,
            max_visible: 500,
            batch_window_ms: 200,
        }
    }
}

/// Adaptive poll interval bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub base_interval_ms: u64,
}

impl ClockConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 15_000,
            base_interval_ms: 5_000,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on the retry exponent.
    pub max_exponent: u32,
    /// Extra random delay as a fraction of the computed delay (0 disables).
    pub jitter: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_exponent: 6,
            jitter: 0.1,
        }
    }
}

/// Heartbeat watchdog.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_every_ms: u64,
    pub timeout_ms: u64,
}

impl WatchdogConfig {
    pub fn check_every(&self) -> Duration {
        Duration::from_millis(self.check_every_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_every_ms: 25_000,
            timeout_ms: 20_000,
        }
    }
}
