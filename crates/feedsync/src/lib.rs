//! Client-side realtime feed synchronization.
//!
//! - **FeedBuffer**: stages incoming items behind a "new items" banner, dedups by id,
//!   batches bursts, and merges on demand without disturbing the reader.
//! - **AdaptiveClock**: poll interval driven by response outcome, tab visibility and
//!   connectivity.
//! - **TransportMachine**: push → stream → polling fallback with bounded exponential
//!   backoff and a heartbeat watchdog, as a pure signal/directive machine.
//! - **FeedController**: spawns the single-writer session that wires a [`FeedSource`]
//!   to the above and publishes [`FeedSnapshot`]s.
//! - **AnchorTracker**: keeps the reader's row fixed across merges.

pub mod anchor;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod item;
pub mod schedule;
pub mod transport;

pub use anchor::{Anchor, AnchorTracker, RenderedRow, Viewport};
pub use buffer::{FeedBuffer, StageReport};
pub use clock::{AdaptiveClock, ResponseType};
pub use config::{
    BufferConfig, ClockConfig, EndpointConfig, FeedConfig, ReconnectionConfig, WatchdogConfig,
};
pub use controller::{FeedController, FeedHandle, FeedSnapshot};
pub use cursor::Cursor;
pub use error::FeedError;
pub use item::Item;
pub use transport::{
    Cadence, ConnectionState, FeedSource, FetchOutcome, HttpSource, Inbound, InboundStream, Tier,
    TierSet,
};
