//! Session behaviour against a scripted source, on paused tokio time.

mod common;

use common::{cursor_at, init_tracing, item, test_config, ScriptedSource};
use feedsync::{
    ConnectionState, FeedController, FeedError, FeedHandle, FeedSnapshot, FetchOutcome, Inbound,
    Tier, TierSet,
};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const PUSH_ONLY: TierSet = TierSet {
    push: true,
    stream: false,
};
const STREAM_ONLY: TierSet = TierSet {
    push: false,
    stream: true,
};

async fn wait_until(feed: &FeedHandle, pred: impl FnMut(&FeedSnapshot) -> bool) -> FeedSnapshot {
    let mut rx = feed.subscribe();
    let snap = timeout(Duration::from_secs(120), rx.wait_for(pred))
        .await
        .expect("condition not reached")
        .expect("session alive");
    snap.clone()
}

fn ids(snap: &FeedSnapshot) -> Vec<&str> {
    snap.visible.iter().map(|i| i.id.as_str()).collect()
}

fn connected(tier: Tier) -> impl FnMut(&FeedSnapshot) -> bool {
    move |s| s.connection == ConnectionState::Connected(tier)
}

#[tokio::test(start_paused = true)]
async fn polling_stages_fresh_items_until_merged() {
    init_tracing();
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_poll(Ok(FetchOutcome::Items {
        items: vec![item("n1", 1), item("n2", 2), item("n3", 3)],
        revision: Some("\"v1\"".into()),
    }));
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0), item("b", -5)])
        .spawn()
        .unwrap();

    let snap = wait_until(&feed, |s| s.new_count == 3).await;
    assert!(snap.banner_visible);
    assert!(snap.is_live);
    assert_eq!(ids(&snap), ["a", "b"]);
    assert_eq!(snap.cursor, cursor_at(3));
    assert_eq!(snap.connection, ConnectionState::Connected(Tier::Polling));
    assert_eq!(source.poll_cursors()[0], cursor_at(0));

    // Next poll asks for items after the newest one seen, revalidating the ETag.
    sleep(Duration::from_secs(6)).await;
    assert_eq!(source.poll_cursors()[1], cursor_at(3));
    assert_eq!(source.poll_revisions()[1].as_deref(), Some("\"v1\""));

    assert_eq!(feed.merge_now().await.unwrap(), 3);
    let snap = wait_until(&feed, |s| s.visible.len() == 5).await;
    assert_eq!(ids(&snap), ["n3", "n2", "n1", "a", "b"]);
    assert_eq!(snap.new_count, 0);
    assert!(!snap.banner_visible);
}

#[tokio::test(start_paused = true)]
async fn burst_is_applied_once() {
    init_tracing();
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();
    let start = wait_until(&feed, connected(Tier::Polling)).await;

    feed.add_items(vec![item("x1", 1)], cursor_at(1)).await.unwrap();
    feed.add_items(vec![item("x2", 2), item("x1", 1)], cursor_at(2))
        .await
        .unwrap();
    feed.add_items(vec![item("a", 0)], cursor_at(2)).await.unwrap();

    let snap = wait_until(&feed, |s| s.new_count > 0).await;
    assert_eq!(snap.new_count, 2);
    assert_eq!(snap.revision, start.revision + 1);
    assert_eq!(snap.cursor, cursor_at(2));

    let err = feed.add_items(Vec::new(), cursor_at(-10)).await.unwrap_err();
    assert!(matches!(err, FeedError::CursorRegression { .. }));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(feed.snapshot().cursor, cursor_at(2));
}

#[tokio::test(start_paused = true)]
async fn flush_applies_window_immediately() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    feed.add_items(vec![item("x1", 1), item("a", 0)], cursor_at(1))
        .await
        .unwrap();
    let report = feed.flush().await.unwrap();
    assert_eq!(report.staged, 1);
    assert_eq!(report.duplicates, 1);
}

#[tokio::test(start_paused = true)]
async fn falls_back_push_to_stream_to_polling() {
    init_tracing();
    let (source, mut subs) = ScriptedSource::new(TierSet::ALL);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let push = subs.recv().await.unwrap();
    assert_eq!(push.tier, Tier::Push);
    let started = Instant::now();

    // Push never confirms; the subscribe timeout moves on to the stream tier.
    let stream = subs.recv().await.unwrap();
    assert_eq!(stream.tier, Tier::Stream);
    assert_eq!(stream.cursor, cursor_at(0));
    assert!(started.elapsed() >= Duration::from_secs(10));

    stream.send(Inbound::Subscribed);
    let snap = wait_until(&feed, connected(Tier::Stream)).await;
    assert!(snap.is_live);

    drop(stream);
    let snap = wait_until(&feed, connected(Tier::Polling)).await;
    assert!(snap.is_live);
    drop(push);
}

#[tokio::test(start_paused = true)]
async fn push_drops_items_older_than_cursor() {
    let (source, mut subs) = ScriptedSource::new(PUSH_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let push = subs.recv().await.unwrap();
    push.send(Inbound::Subscribed);
    wait_until(&feed, connected(Tier::Push)).await;

    push.send(Inbound::Items {
        items: vec![item("late", -30)],
        cursor: Some(cursor_at(-30)),
    });
    push.send(Inbound::Items {
        items: vec![item("n1", 1)],
        cursor: Some(cursor_at(1)),
    });

    let snap = wait_until(&feed, |s| s.new_count > 0).await;
    assert_eq!(snap.new_count, 1);
    assert_eq!(snap.cursor, cursor_at(1));
    feed.merge_now().await.unwrap();
    let snap = wait_until(&feed, |s| s.new_count == 0).await;
    assert_eq!(ids(&snap), ["n1", "a"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_message_keeps_link() {
    let (source, mut subs) = ScriptedSource::new(STREAM_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let stream = subs.recv().await.unwrap();
    assert_eq!(stream.tier, Tier::Stream);
    stream.send(Inbound::Subscribed);
    stream.fail(FeedError::Protocol("unexpected payload".into()));
    stream.send(Inbound::Items {
        items: vec![item("n1", 1)],
        cursor: None,
    });

    let snap = wait_until(&feed, |s| s.new_count > 0).await;
    assert_eq!(snap.connection, ConnectionState::Connected(Tier::Stream));
    assert_eq!(snap.cursor, cursor_at(1));
    assert!(subs.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn malformed_poll_keeps_polling() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_poll(Ok(FetchOutcome::NotModified));
    source.push_poll(Err(FeedError::Protocol("bad body".into())));
    source.push_items(vec![item("n1", 1)]);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let snap = wait_until(&feed, |s| s.new_count > 0).await;
    assert_eq!(snap.connection, ConnectionState::Connected(Tier::Polling));
    assert!(snap.is_live);
    // No error backoff on the clock and no short reconnect retry.
    assert!(snap.interval < Duration::from_secs(5));
    let times = source.poll_times();
    assert_eq!(times.len(), 3);
    assert!(times[2] - times[1] >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn polling_only_source_follows_adaptive_clock() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    sleep(Duration::from_secs(60)).await;
    let times = source.poll_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();

    // Every answer is NotModified: 5s base stretched by 1.2 per poll, capped at 15s.
    assert_eq!(times.len(), 7);
    assert!(gaps[0] >= Duration::from_millis(5_999) && gaps[0] <= Duration::from_millis(6_001));
    assert!(gaps.windows(2).all(|w| w[1] > w[0]));
    assert!(gaps.iter().all(|g| *g <= Duration::from_secs(15)));
    assert_eq!(feed.snapshot().interval, Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn reconnect_leaves_attempt_in_flight_alone() {
    let (source, mut subs) = ScriptedSource::new(PUSH_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let push = subs.recv().await.unwrap();
    feed.reconnect().await.unwrap();
    feed.reconnect().await.unwrap();
    // Round trip so both reconnects are handled before the confirmation lands.
    feed.flush().await.unwrap();

    push.send(Inbound::Subscribed);
    wait_until(&feed, connected(Tier::Push)).await;
    assert!(subs.try_recv().is_err());

    // Connected: a manual reconnect starts over from the top tier.
    feed.reconnect().await.unwrap();
    let again = subs.recv().await.unwrap();
    assert_eq!(again.tier, Tier::Push);
}

#[tokio::test(start_paused = true)]
async fn watchdog_reopens_silent_link() {
    let (source, mut subs) = ScriptedSource::new(PUSH_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let push = subs.recv().await.unwrap();
    push.send(Inbound::Subscribed);
    wait_until(&feed, connected(Tier::Push)).await;
    let started = Instant::now();

    // A heartbeat at 15s carries the link past the 25s check.
    sleep(Duration::from_secs(15)).await;
    push.send(Inbound::Heartbeat);

    let again = subs.recv().await.unwrap();
    assert_eq!(again.tier, Tier::Push);
    assert!(started.elapsed() >= Duration::from_secs(45));
}

#[tokio::test(start_paused = true)]
async fn failed_poll_backs_off_then_retries() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_poll(Err(FeedError::Status {
        status: 500,
        url: "http://test/api/news".into(),
    }));
    let started = Instant::now();
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let snap = wait_until(&feed, connected(Tier::Polling)).await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(source.poll_cursors().len(), 2);
    assert!(snap.interval > Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn offline_pins_interval_and_online_reconnects() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();
    wait_until(&feed, connected(Tier::Polling)).await;

    feed.set_online(false).await.unwrap();
    let snap = wait_until(&feed, |s| !s.online).await;
    assert_eq!(snap.connection, ConnectionState::Disconnected);
    assert_eq!(snap.interval, Duration::from_secs(15));
    assert!(!snap.is_live);

    feed.set_online(true).await.unwrap();
    let snap = wait_until(&feed, |s| s.online && s.connection.is_connected()).await;
    assert!(snap.interval < Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn hidden_suspends_and_visible_resumes() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();
    wait_until(&feed, connected(Tier::Polling)).await;

    feed.set_visible(false).await.unwrap();
    let snap = wait_until(&feed, |s| !s.tab_visible).await;
    assert_eq!(snap.connection, ConnectionState::Disconnected);
    assert!(!snap.is_live);

    let polls = source.poll_cursors().len();
    sleep(Duration::from_secs(60)).await;
    assert_eq!(source.poll_cursors().len(), polls);

    feed.set_visible(true).await.unwrap();
    wait_until(&feed, |s| s.tab_visible && s.connection.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_halts_until_reconnect() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();
    wait_until(&feed, connected(Tier::Polling)).await;

    feed.disconnect().await.unwrap();
    wait_until(&feed, |s| s.connection == ConnectionState::Disconnected).await;

    // Coming back online is not enough after an explicit stop.
    feed.set_online(false).await.unwrap();
    feed.set_online(true).await.unwrap();
    sleep(Duration::from_secs(30)).await;
    let snap = feed.snapshot();
    assert_eq!(snap.connection, ConnectionState::Disconnected);
    assert!(!snap.is_live);

    feed.reconnect().await.unwrap();
    wait_until(&feed, connected(Tier::Polling)).await;
}

#[tokio::test(start_paused = true)]
async fn load_older_appends_page() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_page(vec![item("c", -10), item("b", -5), item("d", -20)]);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0), item("b", -5)])
        .spawn()
        .unwrap();

    assert_eq!(feed.load_older().await.unwrap(), 2);
    assert_eq!(source.page_cursors(), [cursor_at(-5)]);
    let snap = wait_until(&feed, |s| s.visible.len() == 4).await;
    assert_eq!(ids(&snap), ["a", "b", "c", "d"]);
    assert_eq!(snap.new_count, 0);
}

#[tokio::test(start_paused = true)]
async fn newer_page_request_supersedes_older() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_page_after(Duration::from_secs(8), vec![item("slow", -30)]);
    source.push_page(vec![item("c", -10)]);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .initial_items(vec![item("a", 0), item("b", -5)])
        .spawn()
        .unwrap();

    let first = tokio::spawn({
        let feed = feed.clone();
        async move { feed.load_older().await }
    });
    while source.page_cursors().is_empty() {
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(feed.load_older().await.unwrap(), 1);
    assert!(matches!(first.await.unwrap(), Err(FeedError::Cancelled)));

    sleep(Duration::from_secs(10)).await;
    let snap = wait_until(&feed, |s| s.visible.len() >= 3).await;
    assert_eq!(ids(&snap), ["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn first_page_seeds_visible() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    source.push_page(vec![item("y", -1), item("x", 0)]);
    let feed = FeedController::new(test_config())
        .source(source.clone())
        .spawn()
        .unwrap();

    let snap = wait_until(&feed, |s| s.visible.len() == 2).await;
    assert_eq!(ids(&snap), ["x", "y"]);
    assert_eq!(snap.cursor, cursor_at(0));
    assert_eq!(source.page_cursors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_session() {
    let (source, _subs) = ScriptedSource::new(TierSet::POLLING_ONLY);
    let feed = FeedController::new(test_config())
        .source(source)
        .initial_items(vec![item("a", 0)])
        .spawn()
        .unwrap();

    let mut rx = feed.subscribe();
    feed.shutdown().await.unwrap();
    while rx.changed().await.is_ok() {}
    assert!(matches!(
        feed.merge_now().await,
        Err(FeedError::SessionClosed)
    ));
}

#[test]
fn spawn_requires_source() {
    let err = FeedController::new(test_config()).spawn().err().unwrap();
    assert!(matches!(err, FeedError::MissingSource));
}
