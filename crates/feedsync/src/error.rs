//! Error taxonomy for the feed engine.
//!
//! Network and transport errors are recovered inside the session (fallback or
//! backoff); only [`FeedError::CursorRegression`] signals a logic error.

use std::time::Duration;
use thiserror::Error;

use crate::cursor::Cursor;
use crate::transport::Tier;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{from} tier degraded: {reason}")]
    TransportDegraded { from: Tier, reason: String },
    #[error("no heartbeat for {silent_for:?}")]
    WatchdogTimeout { silent_for: Duration },
    #[error("cursor regression: {attempted} is older than {current}")]
    CursorRegression { current: Cursor, attempted: Cursor },
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("request superseded by a newer one")]
    Cancelled,
    #[error("feed session closed")]
    SessionClosed,
    #[error("no feed source configured")]
    MissingSource,
}

impl FeedError {
    /// Fetch failed, timed out, was aborted, or the socket dropped.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FeedError::Http(_)
                | FeedError::Status { .. }
                | FeedError::Timeout(_)
                | FeedError::WebSocket(_)
                | FeedError::Closed
                | FeedError::Cancelled
        )
    }

    /// A single bad payload; the connection stays up.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FeedError::Protocol(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Protocol(e.to_string())
    }
}
