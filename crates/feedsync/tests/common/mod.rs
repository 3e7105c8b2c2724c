//! Common helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use feedsync::{
    Cursor, FeedConfig, FeedError, FeedSource, FetchOutcome, Inbound, InboundStream, Item,
    ReconnectionConfig, Tier, TierSet,
};
use futures_util::{stream, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("feedsync=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// 2024-03-01T08:00:00Z, the reference instant for test items.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

/// Item published `minutes` after [`base_time`] (negative for older).
pub fn item(id: &str, minutes: i64) -> Item {
    Item::new(id, base_time() + ChronoDuration::minutes(minutes)).with_field("title", id)
}

pub fn cursor_at(minutes: i64) -> Cursor {
    Cursor::new(base_time() + ChronoDuration::minutes(minutes))
}

/// Defaults with jitter off so retry delays are exact.
pub fn test_config() -> FeedConfig {
    FeedConfig {
        reconnection: ReconnectionConfig {
            jitter: 0.0,
            ..ReconnectionConfig::default()
        },
        ..FeedConfig::default()
    }
}

/// An open subscription handed to the test; send on `tx` to feed the session,
/// drop it to end the stream.
pub struct Subscription {
    pub tier: Tier,
    pub cursor: Cursor,
    pub tx: mpsc::UnboundedSender<Result<Inbound, FeedError>>,
}

impl Subscription {
    pub fn send(&self, inbound: Inbound) {
        let _ = self.tx.send(Ok(inbound));
    }

    pub fn fail(&self, err: FeedError) {
        let _ = self.tx.send(Err(err));
    }
}

#[derive(Default)]
struct Script {
    polls: VecDeque<Result<FetchOutcome, FeedError>>,
    pages: VecDeque<(Duration, Vec<Item>)>,
    poll_cursors: Vec<Cursor>,
    poll_times: Vec<Instant>,
    poll_revisions: Vec<Option<String>>,
    page_cursors: Vec<Cursor>,
}

/// In-memory [`FeedSource`]. Polls and pages are answered from queues (an empty poll
/// queue answers `NotModified`, an empty page queue an empty page); subscriptions
/// are handed to the test through [`ScriptedSource::subscriptions`].
#[derive(Clone)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
    tiers: TierSet,
    subscriptions: mpsc::UnboundedSender<Subscription>,
}

impl ScriptedSource {
    pub fn new(tiers: TierSet) -> (Self, mpsc::UnboundedReceiver<Subscription>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::default(),
                tiers,
                subscriptions: tx,
            },
            rx,
        )
    }

    pub fn push_poll(&self, outcome: Result<FetchOutcome, FeedError>) {
        self.script.lock().unwrap().polls.push_back(outcome);
    }

    pub fn push_items(&self, items: Vec<Item>) {
        self.push_poll(Ok(FetchOutcome::Items {
            items,
            revision: None,
        }));
    }

    pub fn push_page(&self, items: Vec<Item>) {
        self.push_page_after(Duration::ZERO, items);
    }

    /// A page answered only after `delay`.
    pub fn push_page_after(&self, delay: Duration, items: Vec<Item>) {
        self.script.lock().unwrap().pages.push_back((delay, items));
    }

    pub fn poll_cursors(&self) -> Vec<Cursor> {
        self.script.lock().unwrap().poll_cursors.clone()
    }

    /// When each poll was issued, on tokio's clock.
    pub fn poll_times(&self) -> Vec<Instant> {
        self.script.lock().unwrap().poll_times.clone()
    }

    pub fn poll_revisions(&self) -> Vec<Option<String>> {
        self.script.lock().unwrap().poll_revisions.clone()
    }

    pub fn page_cursors(&self) -> Vec<Cursor> {
        self.script.lock().unwrap().page_cursors.clone()
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn fetch_after(
        &self,
        cursor: Cursor,
        _limit: usize,
        revision: Option<String>,
    ) -> Result<FetchOutcome, FeedError> {
        let mut script = self.script.lock().unwrap();
        script.poll_cursors.push(cursor);
        script.poll_times.push(Instant::now());
        script.poll_revisions.push(revision);
        script
            .polls
            .pop_front()
            .unwrap_or(Ok(FetchOutcome::NotModified))
    }

    async fn fetch_before(&self, cursor: Cursor, _limit: usize) -> Result<Vec<Item>, FeedError> {
        let (delay, items) = {
            let mut script = self.script.lock().unwrap();
            script.page_cursors.push(cursor);
            script.pages.pop_front().unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(items)
    }

    fn tiers(&self) -> TierSet {
        self.tiers
    }

    async fn subscribe(&self, tier: Tier, cursor: Cursor) -> Result<InboundStream, FeedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .send(Subscription { tier, cursor, tx })
            .map_err(|_| FeedError::Closed)?;
        let inbound = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|next| (next, rx))
        });
        Ok(inbound.boxed())
    }
}

/// Serve `app` on an ephemeral localhost port.
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}
