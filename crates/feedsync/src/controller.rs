//! Feed controller: one session task that owns the buffer, the adaptive clock, and the
//! transport state machine.
//!
//! The session is the only writer of visible/staged/cursor. Embedders talk to it
//! through a [`FeedHandle`] and read [`FeedSnapshot`]s from a watch channel; links,
//! polls and page fetches run as child tasks that report back over an mpsc channel.
//! A link is tagged with the generation it was opened in, so anything a torn-down
//! link still delivers is ignored.

use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::buffer::{FeedBuffer, StageReport};
use crate::clock::{AdaptiveClock, ResponseType};
use crate::config::FeedConfig;
use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::{newest, Item};
use crate::schedule::Timer;
use crate::transport::{
    Cadence, ConnectionState, Directive, FeedSource, FetchOutcome, Inbound, Signal, Tier,
    TransportMachine,
};

/// What the UI renders. Cheap to clone; `visible` is shared.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub visible: Arc<[Item]>,
    pub new_count: usize,
    pub banner_visible: bool,
    pub is_live: bool,
    pub cursor: Cursor,
    pub connection: ConnectionState,
    #[serde(rename = "interval_ms", serialize_with = "as_millis")]
    pub interval: Duration,
    pub online: bool,
    pub tab_visible: bool,
    pub revision: u64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl FeedSnapshot {
    fn same_as(&self, other: &FeedSnapshot) -> bool {
        Arc::ptr_eq(&self.visible, &other.visible)
            && self.new_count == other.new_count
            && self.is_live == other.is_live
            && self.cursor == other.cursor
            && self.connection == other.connection
            && self.interval == other.interval
            && self.online == other.online
            && self.tab_visible == other.tab_visible
            && self.revision == other.revision
    }
}

enum Command {
    MergeNow(oneshot::Sender<usize>),
    Flush(oneshot::Sender<StageReport>),
    LoadOlder(oneshot::Sender<Result<usize, FeedError>>),
    AddItems {
        items: Vec<Item>,
        cursor: Cursor,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Reconnect,
    Disconnect,
    SetVisible(bool),
    SetOnline(bool),
    Shutdown,
}

enum Event {
    /// `inbound: None` means the subscription stream ended.
    Link {
        generation: u64,
        tier: Tier,
        inbound: Option<Result<Inbound, FeedError>>,
    },
    Poll {
        generation: u64,
        result: Result<FetchOutcome, FeedError>,
    },
    Page {
        seq: u64,
        result: Result<Vec<Item>, FeedError>,
        reply: oneshot::Sender<Result<usize, FeedError>>,
    },
}

/// Builder for a feed session.
pub struct FeedController {
    config: FeedConfig,
    source: Option<Arc<dyn FeedSource>>,
    initial: Option<Vec<Item>>,
}

impl FeedController {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            source: None,
            initial: None,
        }
    }

    pub fn source(mut self, source: impl FeedSource) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Seed the visible list instead of fetching the first page.
    pub fn initial_items(mut self, items: Vec<Item>) -> Self {
        self.initial = Some(items);
        self
    }

    /// Spawn the session on the current tokio runtime.
    pub fn spawn(self) -> Result<FeedHandle, FeedError> {
        let source = self
            .source
            .ok_or(FeedError::MissingSource)?;
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);

        let buffer = FeedBuffer::new(self.config.buffer.clone(), Vec::new(), Cursor::now());
        let clock = AdaptiveClock::new(self.config.clock.clone());
        let machine = TransportMachine::new(
            self.config.reconnection.clone(),
            self.config.watchdog.timeout(),
            source.tiers(),
        );
        let first = snapshot_of(&buffer, &clock, &machine, Arc::from(Vec::new()));
        let (snapshot_tx, snapshot_rx) = watch::channel(first);

        let session = Session {
            config: self.config,
            source,
            buffer,
            clock,
            machine,
            commands: commands_rx,
            events_tx,
            events: events_rx,
            snapshot: snapshot_tx,
            visible_cache: (u64::MAX, Arc::from(Vec::new())),
            generation: 0,
            link: None,
            poll: None,
            page: InFlight::default(),
            revision_tag: None,
            batch_timer: Timer::new("batch"),
            connect_timer: Timer::new("connect"),
            retry_timer: Timer::new("retry"),
            poll_timer: Timer::new("poll"),
            watchdog_timer: Timer::new("watchdog"),
        };
        tokio::spawn(session.run(self.initial));
        Ok(FeedHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        })
    }
}

/// Public surface of a running session. Clone freely; the session stops when every
/// handle is dropped or [`FeedHandle::shutdown`] is called.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<FeedSnapshot>,
}

impl FeedHandle {
    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot.clone()
    }

    /// Promote staged items. Capture a scroll anchor before calling this and restore
    /// it after the next render.
    pub async fn merge_now(&self) -> Result<usize, FeedError> {
        self.request(Command::MergeNow).await
    }

    /// Apply the open batching window immediately.
    pub async fn flush(&self) -> Result<StageReport, FeedError> {
        self.request(Command::Flush).await
    }

    /// Fetch the page below the oldest visible item and append it.
    pub async fn load_older(&self) -> Result<usize, FeedError> {
        self.request(Command::LoadOlder).await?
    }

    /// Hand items from an embedder-owned source to the buffer.
    pub async fn add_items(&self, items: Vec<Item>, cursor: Cursor) -> Result<(), FeedError> {
        self.request(|reply| Command::AddItems {
            items,
            cursor,
            reply,
        })
        .await?
    }

    /// Manual reconnect: full attempt from the top tier.
    pub async fn reconnect(&self) -> Result<(), FeedError> {
        self.send(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), FeedError> {
        self.send(Command::Disconnect).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), FeedError> {
        self.send(Command::SetVisible(visible)).await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), FeedError> {
        self.send(Command::SetOnline(online)).await
    }

    pub async fn shutdown(&self) -> Result<(), FeedError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, cmd: Command) -> Result<(), FeedError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| FeedError::SessionClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, FeedError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| FeedError::Cancelled)
    }
}

/// One request kind where only the newest counts. Starting a new one aborts the
/// previous task; results carry the sequence number they were started with.
#[derive(Debug, Default)]
struct InFlight {
    seq: u64,
    task: Option<JoinHandle<()>>,
}

impl InFlight {
    /// Abort whatever is running and hand out the sequence for the next request.
    fn next(&mut self) -> u64 {
        self.abort();
        self.seq += 1;
        self.seq
    }

    fn set(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// True when `seq` is the current request; its task is then released.
    fn finish(&mut self, seq: u64) -> bool {
        if seq != self.seq {
            return false;
        }
        self.task = None;
        true
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

struct Session {
    config: FeedConfig,
    source: Arc<dyn FeedSource>,
    buffer: FeedBuffer,
    clock: AdaptiveClock,
    machine: TransportMachine,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    snapshot: watch::Sender<FeedSnapshot>,
    visible_cache: (u64, Arc<[Item]>),
    generation: u64,
    link: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
    page: InFlight,
    /// ETag of the last delta poll.
    revision_tag: Option<String>,
    batch_timer: Timer,
    connect_timer: Timer,
    retry_timer: Timer,
    poll_timer: Timer,
    watchdog_timer: Timer,
}

impl Session {
    async fn run(mut self, initial: Option<Vec<Item>>) {
        self.seed(initial).await;
        self.signal(Signal::Connect);
        self.watchdog_timer.arm(self.config.watchdog.check_every());
        self.publish();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = self.batch_timer.fired() => {
                    self.buffer.expire(Instant::now());
                }
                _ = self.connect_timer.fired() => self.on_connect_timeout(),
                _ = self.retry_timer.fired() => self.signal(Signal::RetryDue),
                _ = self.poll_timer.fired() => self.start_poll(),
                _ = self.watchdog_timer.fired() => {
                    self.watchdog_timer.arm(self.config.watchdog.check_every());
                    self.signal(Signal::WatchdogCheck { now: Instant::now() });
                }
            }
            self.publish();
        }

        self.teardown();
        tracing::debug!("feed session stopped");
    }

    async fn seed(&mut self, initial: Option<Vec<Item>>) {
        let items = match initial {
            Some(items) => items,
            None => {
                let limit = self.config.page_limit;
                let fetch = self.source.fetch_before(Cursor::now(), limit);
                match timeout(self.config.request_timeout(), fetch).await {
                    Ok(Ok(items)) => items,
                    Ok(Err(e)) => {
                        tracing::warn!(reason = %e, "initial page failed, starting empty");
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!("initial page timed out, starting empty");
                        Vec::new()
                    }
                }
            }
        };
        let cursor = newest(&items).map_or_else(Cursor::now, Cursor::new);
        tracing::info!(count = items.len(), %cursor, "feed seeded");
        self.buffer = FeedBuffer::new(self.config.buffer.clone(), items, cursor);
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::MergeNow(reply) => {
                let promoted = self.buffer.merge_now();
                let _ = reply.send(promoted);
            }
            Command::Flush(reply) => {
                self.batch_timer.cancel();
                let _ = reply.send(self.buffer.flush());
            }
            Command::LoadOlder(reply) => self.start_page(reply),
            Command::AddItems {
                items,
                cursor,
                reply,
            } => {
                let _ = reply.send(self.ingest(items, cursor));
            }
            Command::Reconnect => self.signal(Signal::Connect),
            Command::Disconnect => {
                self.signal(Signal::Disconnect);
                self.batch_timer.cancel();
                self.buffer.disconnect();
            }
            Command::SetVisible(visible) => {
                self.clock.set_visible(visible);
                self.signal(if visible {
                    Signal::Visible
                } else {
                    Signal::Hidden
                });
            }
            Command::SetOnline(online) => {
                self.clock.set_online(online);
                self.signal(if online {
                    Signal::Online
                } else {
                    Signal::Offline
                });
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Link {
                generation,
                tier,
                inbound,
            } => {
                if generation != self.generation {
                    return;
                }
                self.on_inbound(tier, inbound);
            }
            Event::Poll { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.poll = None;
                self.on_poll(result);
            }
            Event::Page { seq, result, reply } => {
                if !self.page.finish(seq) {
                    // Superseded: its result was queued before the newer request aborted it.
                    let _ = reply.send(Err(FeedError::Cancelled));
                    return;
                }
                let outcome = result.map(|items| self.buffer.append_to_visible(items));
                if let Err(e) = &outcome {
                    tracing::warn!(reason = %e, "older page failed");
                }
                let _ = reply.send(outcome);
            }
        }
    }

    fn on_inbound(&mut self, tier: Tier, inbound: Option<Result<Inbound, FeedError>>) {
        let now = Instant::now();
        match inbound {
            None => self.signal(Signal::TierFailed {
                tier,
                reason: "stream ended".into(),
            }),
            Some(Err(e)) if e.is_protocol() => {
                tracing::warn!(%tier, error = %e, "dropping malformed message");
            }
            Some(Err(e)) => self.signal(Signal::TierFailed {
                tier,
                reason: e.to_string(),
            }),
            Some(Ok(Inbound::Subscribed)) => {
                self.connect_timer.cancel();
                self.signal(Signal::Subscribed { tier, at: now });
            }
            Some(Ok(Inbound::Heartbeat)) => self.signal(Signal::Activity { at: now }),
            Some(Ok(Inbound::Items { mut items, cursor })) => {
                self.signal(Signal::Activity { at: now });
                if tier == Tier::Push {
                    // Push delivery is not ordered; anything older than the cursor is stale.
                    let floor = self.buffer.latest_cursor().at();
                    items.retain(|i| i.published_at >= floor);
                    if items.is_empty() {
                        tracing::debug!("dropping out-of-order push insert");
                        return;
                    }
                }
                let cursor = cursor
                    .or_else(|| newest(&items).map(Cursor::new))
                    .unwrap_or_else(|| self.buffer.latest_cursor());
                let _ = self.ingest(items, cursor);
            }
        }
    }

    fn on_poll(&mut self, result: Result<FetchOutcome, FeedError>) {
        match result {
            Ok(FetchOutcome::Items { items, revision }) => {
                if revision.is_some() {
                    self.revision_tag = revision;
                }
                match newest(&items) {
                    Some(at) => {
                        self.clock.set_response_type(ResponseType::Success);
                        tracing::debug!(count = items.len(), "poll returned items");
                        let _ = self.ingest(items, Cursor::new(at));
                    }
                    None => self.clock.set_response_type(ResponseType::NotModified),
                }
            }
            Ok(FetchOutcome::NotModified) => {
                self.clock.set_response_type(ResponseType::NotModified);
            }
            Err(e) if e.is_protocol() => {
                tracing::warn!(error = %e, "dropping malformed poll response");
                self.schedule_poll();
                return;
            }
            Err(e) => {
                self.clock.set_response_type(ResponseType::Error);
                self.signal(Signal::TierFailed {
                    tier: Tier::Polling,
                    reason: e.to_string(),
                });
                return;
            }
        }
        self.signal(Signal::PollSucceeded { at: Instant::now() });
        self.schedule_poll();
    }

    fn schedule_poll(&mut self) {
        if self.machine.state().tier() == Some(Tier::Polling) {
            let delay = match self.machine.cadence() {
                Cadence::Fixed => self.config.poll_period(),
                Cadence::Adaptive => self.clock.interval(),
            };
            self.poll_timer.arm(delay);
        }
    }

    fn on_connect_timeout(&mut self) {
        if let ConnectionState::Connecting(tier @ (Tier::Push | Tier::Stream)) =
            self.machine.state()
        {
            self.signal(Signal::TierFailed {
                tier,
                reason: "subscribe timeout".into(),
            });
        }
    }

    fn ingest(&mut self, items: Vec<Item>, cursor: Cursor) -> Result<(), FeedError> {
        let result = self.buffer.add_items(items, cursor, Instant::now());
        if let Err(e) = &result {
            tracing::error!(error = %e, "cursor would move backward");
        }
        if let Some(at) = self.buffer.deadline() {
            self.batch_timer.arm_at(at);
        }
        result
    }

    fn signal(&mut self, signal: Signal) {
        for directive in self.machine.dispatch(signal) {
            self.execute(directive);
        }
        let live = self.machine.state().is_connected();
        self.buffer.set_live(live);
    }

    fn execute(&mut self, directive: Directive) {
        match directive {
            Directive::Close => self.close_link(),
            Directive::Open(Tier::Polling, _) => self.start_poll(),
            Directive::Open(tier, _) => self.open_link(tier),
            Directive::ScheduleRetry(delay) => {
                self.retry_timer.arm(self.jittered(delay));
            }
            Directive::CancelRetry => self.retry_timer.cancel(),
        }
    }

    fn close_link(&mut self) {
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.abort();
        }
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        self.connect_timer.cancel();
        self.poll_timer.cancel();
    }

    fn open_link(&mut self, tier: Tier) {
        let generation = self.generation;
        let source = Arc::clone(&self.source);
        let tx = self.events_tx.clone();
        let cursor = self.buffer.latest_cursor();
        tracing::info!(%tier, %cursor, "opening subscription");
        self.link = Some(tokio::spawn(async move {
            let mut stream = match source.subscribe(tier, cursor).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(Event::Link {
                            generation,
                            tier,
                            inbound: Some(Err(e)),
                        })
                        .await;
                    return;
                }
            };
            while let Some(inbound) = stream.next().await {
                let event = Event::Link {
                    generation,
                    tier,
                    inbound: Some(inbound),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Event::Link {
                    generation,
                    tier,
                    inbound: None,
                })
                .await;
        }));
        self.connect_timer.arm(self.config.subscribe_timeout());
    }

    fn start_poll(&mut self) {
        if let Some(previous) = self.poll.take() {
            previous.abort();
        }
        let generation = self.generation;
        let source = Arc::clone(&self.source);
        let tx = self.events_tx.clone();
        let cursor = self.buffer.latest_cursor();
        let limit = self.config.page_limit;
        let revision = self.revision_tag.clone();
        let limit_time = self.config.request_timeout();
        self.poll = Some(tokio::spawn(async move {
            let result = match timeout(limit_time, source.fetch_after(cursor, limit, revision)).await
            {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout(limit_time)),
            };
            let _ = tx.send(Event::Poll { generation, result }).await;
        }));
    }

    fn start_page(&mut self, reply: oneshot::Sender<Result<usize, FeedError>>) {
        let seq = self.page.next();
        let source = Arc::clone(&self.source);
        let tx = self.events_tx.clone();
        let cursor = self.buffer.oldest_visible().unwrap_or_else(Cursor::now);
        let limit = self.config.page_limit;
        let limit_time = self.config.request_timeout();
        self.page.set(tokio::spawn(async move {
            let result = match timeout(limit_time, source.fetch_before(cursor, limit)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout(limit_time)),
            };
            let _ = tx.send(Event::Page { seq, result, reply }).await;
        }));
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let cfg = &self.config.reconnection;
        if cfg.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..cfg.jitter));
        (delay + extra).min(Duration::from_millis(cfg.max_backoff_ms).max(delay))
    }

    fn publish(&mut self) {
        if self.visible_cache.0 != self.buffer.revision() {
            self.visible_cache = (self.buffer.revision(), Arc::from(self.buffer.visible()));
        }
        let next = snapshot_of(
            &self.buffer,
            &self.clock,
            &self.machine,
            Arc::clone(&self.visible_cache.1),
        );
        self.snapshot.send_if_modified(|current| {
            if current.same_as(&next) {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn teardown(&mut self) {
        self.machine.dispatch(Signal::Disconnect);
        self.close_link();
        self.page.abort();
        self.retry_timer.cancel();
        self.batch_timer.cancel();
        self.buffer.disconnect();
        self.publish();
    }
}

fn snapshot_of(
    buffer: &FeedBuffer,
    clock: &AdaptiveClock,
    machine: &TransportMachine,
    visible: Arc<[Item]>,
) -> FeedSnapshot {
    FeedSnapshot {
        visible,
        new_count: buffer.new_count(),
        banner_visible: buffer.banner_visible(),
        is_live: buffer.is_live(),
        cursor: buffer.cursor(),
        connection: machine.state(),
        interval: clock.interval(),
        online: clock.is_online(),
        tab_visible: clock.is_visible(),
        revision: buffer.revision(),
    }
}
