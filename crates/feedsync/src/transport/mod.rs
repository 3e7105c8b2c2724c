//! Transport client: how items get from the news API to the buffer.
//!
//! Three tiers are tried in preference order: a WebSocket push channel, a
//! server-sent event stream, and plain polling. [`machine::TransportMachine`] decides
//! which tier to use and when to retry; a [`FeedSource`] does the actual I/O.

pub mod http;
pub mod machine;
pub mod push;
pub mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::fmt;

use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::Item;

pub use http::HttpSource;
pub use machine::{Directive, Signal, TransportMachine};

/// Transport tier, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Push,
    Stream,
    Polling,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Push, Tier::Stream, Tier::Polling];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Push => "push",
            Tier::Stream => "stream",
            Tier::Polling => "polling",
        })
    }
}

/// Which subscription tiers a source offers. Polling is always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSet {
    pub push: bool,
    pub stream: bool,
}

impl TierSet {
    pub const ALL: TierSet = TierSet {
        push: true,
        stream: true,
    };
    pub const POLLING_ONLY: TierSet = TierSet {
        push: false,
        stream: false,
    };

    pub fn contains(&self, tier: Tier) -> bool {
        match tier {
            Tier::Push => self.push,
            Tier::Stream => self.stream,
            Tier::Polling => true,
        }
    }

    /// First offered tier at or after `tier`.
    pub fn at_or_after(&self, tier: Tier) -> Tier {
        Tier::ALL
            .into_iter()
            .find(|t| *t >= tier && self.contains(*t))
            .unwrap_or(Tier::Polling)
    }

    /// Next offered tier strictly after `tier`, if any.
    pub fn after(&self, tier: Tier) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| *t > tier && self.contains(*t))
    }
}

/// Connection state as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "tier", rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting(Tier),
    Connected(Tier),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting(t) | ConnectionState::Connected(t) => Some(*t),
        }
    }
}

/// Poll cadence for the polling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed period; used when the stream tier falls back to polling.
    Fixed,
    /// Follows the adaptive clock; used when backoff lands on polling.
    Adaptive,
}

/// Something a push or stream subscription delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The server confirmed the subscription.
    Subscribed,
    Heartbeat,
    /// New items; `cursor` is the server's watermark when it sends one.
    Items { items: Vec<Item>, cursor: Option<Cursor> },
}

pub type InboundStream = BoxStream<'static, Result<Inbound, FeedError>>;

/// Answer to a conditional delta fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Items {
        items: Vec<Item>,
        /// Revision tag (ETag) to send with the next request.
        revision: Option<String>,
    },
    NotModified,
}

/// The I/O side of the transport. [`HttpSource`] talks to the real API; tests script
/// their own.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Items strictly newer than `cursor`.
    async fn fetch_after(
        &self,
        cursor: Cursor,
        limit: usize,
        revision: Option<String>,
    ) -> Result<FetchOutcome, FeedError>;

    /// A page of items strictly older than `cursor`.
    async fn fetch_before(&self, cursor: Cursor, limit: usize) -> Result<Vec<Item>, FeedError>;

    /// Subscription tiers this source can open.
    fn tiers(&self) -> TierSet;

    /// Open a push or stream subscription. The stream must yield
    /// [`Inbound::Subscribed`] once the server confirms; `Err(Protocol)` entries are
    /// skipped, any other error or the end of the stream fails the tier.
    async fn subscribe(&self, tier: Tier, cursor: Cursor) -> Result<InboundStream, FeedError>;
}
