use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use super::*;
use crate::orderbook::PriceLevel;
use crate::websocket::{FeedConnection, FeedPeer, TransportCommand, TransportEvent};

/// Hands every opened connection's peer end to the test
struct ScriptedTransport {
    opened: mpsc::UnboundedSender<FeedPeer>,
}

impl FeedTransport for ScriptedTransport {
    fn open(&mut self) -> FeedConnection {
        let (connection, peer) = FeedConnection::channel();
        let _ = self.opened.send(peer);
        connection
    }
}

struct Harness {
    handle: EngineHandle,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    opened: mpsc::UnboundedReceiver<FeedPeer>,
}

impl Harness {
    fn start() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let spawned = spawn(Config::default(), ScriptedTransport { opened: opened_tx }).unwrap();
        Self {
            handle: spawned.handle,
            events: spawned.events,
            opened: opened_rx,
        }
    }

    async fn next_peer(&mut self) -> FeedPeer {
        self.opened.recv().await.expect("transport opened")
    }

    async fn next_event(&mut self) -> EngineEvent {
        self.events.recv().await.expect("engine running")
    }

    async fn wait_for_status(&mut self, wanted: ConnectionStatus) {
        loop {
            if let EngineEvent::Status(status) = self.next_event().await {
                if status == wanted {
                    return;
                }
            }
        }
    }

    async fn next_snapshot(&mut self) -> BookSnapshot {
        loop {
            if let EngineEvent::Snapshot(snapshot) = self.next_event().await {
                return snapshot;
            }
        }
    }

    fn drain(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Open the next connection and answer its subscribe request
    async fn subscribe(&mut self, channel_id: u64) -> FeedPeer {
        let mut peer = self.next_peer().await;
        peer.emit(TransportEvent::Open);
        expect_subscribe(&mut peer).await;
        peer.emit(TransportEvent::Message(ack(channel_id)));
        self.wait_for_status(ConnectionStatus::Subscribed).await;
        peer
    }
}

async fn expect_subscribe(peer: &mut FeedPeer) -> serde_json::Value {
    match peer.commands.recv().await {
        Some(TransportCommand::Send(text)) => {
            let request: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(request["event"], "subscribe");
            request
        }
        other => panic!("Expected subscribe request, got {:?}", other),
    }
}

fn ack(channel_id: u64) -> String {
    format!(
        r#"{{"event":"subscribed","channel":"book","chanId":{},"symbol":"tBTCUSD","len":"25"}}"#,
        channel_id
    )
}

fn frame(channel_id: u64, payload: &str) -> TransportEvent {
    TransportEvent::Message(format!("[{},{}]", channel_id, payload))
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn close_count(peer: &mut FeedPeer) -> usize {
    let mut closes = 0;
    loop {
        match peer.commands.try_recv() {
            Ok(TransportCommand::Close) => closes += 1,
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return closes,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn subscribes_and_applies_diffs() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();

    let mut peer = h.next_peer().await;
    assert_eq!(h.next_event().await, EngineEvent::Status(ConnectionStatus::Connecting));

    peer.emit(TransportEvent::Open);
    let request = expect_subscribe(&mut peer).await;
    assert_eq!(request["channel"], "book");
    assert_eq!(request["symbol"], "tBTCUSD");
    assert_eq!(request["prec"], "P0");

    peer.emit(TransportEvent::Message(ack(42)));
    assert_eq!(h.next_event().await, EngineEvent::Status(ConnectionStatus::Subscribed));
    assert_eq!(h.handle.status(), ConnectionStatus::Subscribed);

    peer.emit(frame(42, "[[100,1,5],[101,2,-1.5],[102,1,-2]]"));
    let snapshot = h.next_snapshot().await;
    assert_eq!(snapshot.epoch, 1);
    assert_eq!(
        snapshot.bids,
        vec![PriceLevel { price: dec!(100), count: 1, size: dec!(5) }]
    );
    assert_eq!(snapshot.asks.len(), 2);
    assert_eq!(snapshot.asks[0].price, dec!(101));

    peer.emit(frame(42, "[101,0,1]"));
    let snapshot = h.next_snapshot().await;
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.asks[0].price, dec!(102));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_subscription_without_snapshot() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let peer = h.subscribe(7).await;

    peer.emit(frame(7, "\"hb\""));
    peer.emit(frame(7, "\"hb\""));
    peer.emit(frame(7, "[200,1,1]"));

    // The first event after the heartbeats is the snapshot for the diff
    match h.next_event().await {
        EngineEvent::Snapshot(snapshot) => assert_eq!(snapshot.bids[0].price, dec!(200)),
        other => panic!("Expected snapshot, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn stale_subscription_stalls_and_closes_once() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut peer = h.subscribe(9).await;
    let subscribed_at = Instant::now();

    h.wait_for_status(ConnectionStatus::Stalled).await;
    assert!(subscribed_at.elapsed() >= Duration::from_millis(15_000));
    assert_eq!(h.handle.status(), ConnectionStatus::Stalled);

    settle().await;
    assert_eq!(close_count(&mut peer), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_without_book_data_still_stall() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut peer = h.subscribe(3).await;
    let subscribed_at = Instant::now();

    for _ in 0..12 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        if h.handle.status() == ConnectionStatus::Stalled {
            break;
        }
        peer.emit(frame(3, "\"hb\""));
        settle().await;
    }

    assert_eq!(h.handle.status(), ConnectionStatus::Stalled);
    assert!(subscribed_at.elapsed() <= Duration::from_millis(15_000));
    assert_eq!(close_count(&mut peer), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_live_feed_subscribed() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let peer = h.subscribe(3).await;

    peer.emit(frame(3, "[100,1,1]"));
    h.next_snapshot().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    peer.emit(frame(3, "\"hb\""));
    settle().await;
    let heartbeat_at = Instant::now();

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(h.handle.status(), ConnectionStatus::Subscribed);

    h.wait_for_status(ConnectionStatus::Stalled).await;
    assert!(heartbeat_at.elapsed() >= Duration::from_millis(15_000));
}

#[tokio::test(start_paused = true)]
async fn first_data_cancels_loading_warning() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let peer = h.subscribe(5).await;

    peer.emit(frame(5, "[100,1,1]"));
    h.next_snapshot().await;

    tokio::time::advance(Duration::from_millis(5_000)).await;
    settle().await;
    assert!(h
        .drain()
        .iter()
        .all(|event| !matches!(event, EngineEvent::Warning(EngineWarning::LoadingSlow { .. }))));
    assert_eq!(h.handle.status(), ConnectionStatus::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn precision_change_while_awaiting_ack_drops_old_channel() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();

    let mut old = h.next_peer().await;
    old.emit(TransportEvent::Open);
    expect_subscribe(&mut old).await;

    h.handle.change_precision(2).unwrap();
    // Late traffic for the superseded subscription
    old.emit(TransportEvent::Message(ack(1)));
    old.emit(frame(1, "[500,1,1]"));
    assert_eq!(old.commands.recv().await, Some(TransportCommand::Close));
    old.emit(TransportEvent::Closed);

    let mut new = h.next_peer().await;
    // The old connection is gone once the replacement exists
    assert!(!old.emit(frame(1, "[501,1,1]")));

    new.emit(TransportEvent::Open);
    let request = expect_subscribe(&mut new).await;
    assert_eq!(request["prec"], "P2");

    new.emit(frame(1, "[502,1,1]"));
    new.emit(TransportEvent::Message(ack(2)));
    new.emit(frame(1, "[503,1,1]"));
    new.emit(frame(2, "[600,1,-1]"));

    let snapshot = h.next_snapshot().await;
    assert_eq!(snapshot.precision, 2);
    assert_eq!(snapshot.epoch, 2);
    assert!(snapshot.bids.is_empty());
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.asks[0].price, dec!(600));
}

#[tokio::test(start_paused = true)]
async fn precision_change_rebuilds_book_from_empty() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut old = h.subscribe(1).await;

    old.emit(frame(1, "[[100,1,5],[101,1,-5]]"));
    assert_eq!(h.next_snapshot().await.bids.len(), 1);

    h.handle.change_precision(1).unwrap();
    assert_eq!(h.next_event().await, EngineEvent::Status(ConnectionStatus::Connecting));
    assert_eq!(old.commands.recv().await, Some(TransportCommand::Close));

    // Nothing is published until the old transport confirms the close
    settle().await;
    assert!(h.drain().is_empty());
    assert!(h.opened.try_recv().is_err());

    old.emit(TransportEvent::Closed);
    let _new = h.next_peer().await;

    let cleared = h.next_snapshot().await;
    assert!(cleared.is_empty());
    assert_eq!(cleared.precision, 1);
    assert_eq!(cleared.epoch, 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_waits_for_close_then_clears_book() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut old = h.subscribe(1).await;

    old.emit(frame(1, "[[100,1,5],[101,1,-5]]"));
    assert_eq!(h.next_snapshot().await.bids.len(), 1);

    h.handle.reconnect().unwrap();
    assert_eq!(h.next_event().await, EngineEvent::Status(ConnectionStatus::Connecting));
    assert_eq!(old.commands.recv().await, Some(TransportCommand::Close));

    settle().await;
    assert!(h.drain().is_empty());
    assert!(h.opened.try_recv().is_err());

    old.emit(TransportEvent::Closed);
    let mut new = h.next_peer().await;
    let cleared = h.next_snapshot().await;
    assert!(cleared.is_empty());
    assert_eq!(cleared.epoch, 2);
    assert_eq!(cleared.precision, 0);

    new.emit(TransportEvent::Open);
    assert_eq!(expect_subscribe(&mut new).await["prec"], "P0");
}

#[tokio::test(start_paused = true)]
async fn rapid_precision_changes_open_a_single_connection() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut old = h.subscribe(1).await;

    h.handle.change_precision(1).unwrap();
    h.handle.change_precision(2).unwrap();
    h.handle.change_precision(3).unwrap();
    settle().await;
    assert_eq!(close_count(&mut old), 1);

    old.emit(TransportEvent::Closed);
    let mut new = h.next_peer().await;
    new.emit(TransportEvent::Open);
    assert_eq!(expect_subscribe(&mut new).await["prec"], "P3");

    settle().await;
    assert!(h.opened.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn close_timeout_drops_unresponsive_transport() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let _old = h.subscribe(1).await;

    h.handle.change_precision(4).unwrap();
    let started = Instant::now();

    // The old peer never confirms; the engine moves on after the close timeout
    let mut new = h.next_peer().await;
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    new.emit(TransportEvent::Open);
    assert_eq!(expect_subscribe(&mut new).await["prec"], "P4");
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_resubscription() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let mut old = h.subscribe(1).await;

    h.handle.change_precision(3).unwrap();
    h.handle.disconnect().unwrap();
    h.wait_for_status(ConnectionStatus::Disconnected).await;

    assert_eq!(close_count(&mut old), 1);
    old.emit(TransportEvent::Closed);
    settle().await;
    assert!(h.opened.try_recv().is_err());
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn transport_loss_keeps_book_until_reconnect() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let peer = h.subscribe(11).await;

    peer.emit(frame(11, "[100,1,5]"));
    h.next_snapshot().await;

    peer.emit(TransportEvent::Error("connection reset".to_string()));
    h.wait_for_status(ConnectionStatus::Disconnected).await;
    settle().await;
    assert!(h
        .drain()
        .iter()
        .all(|event| !matches!(event, EngineEvent::Snapshot(_))));

    h.handle.reconnect().unwrap();
    let mut new = h.next_peer().await;
    assert_eq!(h.next_event().await, EngineEvent::Status(ConnectionStatus::Connecting));
    let cleared = h.next_snapshot().await;
    assert!(cleared.is_empty());

    new.emit(TransportEvent::Open);
    assert_eq!(expect_subscribe(&mut new).await["prec"], "P0");
}

#[tokio::test(start_paused = true)]
async fn malformed_diff_is_dropped_with_warning() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let peer = h.subscribe(4).await;

    peer.emit(frame(4, "[100,1]"));
    match h.next_event().await {
        EngineEvent::Warning(EngineWarning::MalformedDiff(_)) => {}
        other => panic!("Expected malformed diff warning, got {:?}", other),
    }

    peer.emit(frame(4, "[100,1,0]"));
    match h.next_event().await {
        EngineEvent::Warning(EngineWarning::MalformedDiff(_)) => {}
        other => panic!("Expected malformed diff warning, got {:?}", other),
    }

    peer.emit(frame(4, "[100,1,2]"));
    let snapshot = h.next_snapshot().await;
    assert_eq!(snapshot.bids[0].size, dec!(2));
    assert_eq!(h.handle.status(), ConnectionStatus::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn protocol_error_frame_disconnects() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();

    let mut peer = h.next_peer().await;
    peer.emit(TransportEvent::Open);
    expect_subscribe(&mut peer).await;
    peer.emit(TransportEvent::Message(
        r#"{"event":"error","msg":"symbol: invalid","code":10300}"#.to_string(),
    ));

    h.wait_for_status(ConnectionStatus::Disconnected).await;
    assert_eq!(peer.commands.recv().await, Some(TransportCommand::Close));
}

#[tokio::test(start_paused = true)]
async fn stalled_engine_can_reconnect() {
    let mut h = Harness::start();
    h.handle.connect().unwrap();
    let _stalled = h.subscribe(1).await;
    h.wait_for_status(ConnectionStatus::Stalled).await;

    h.handle.reconnect().unwrap();
    let _fresh = h.subscribe(2).await;
    assert_eq!(h.handle.status(), ConnectionStatus::Subscribed);
}

#[tokio::test]
async fn out_of_range_precision_is_rejected() {
    let h = Harness::start();
    assert_eq!(
        h.handle.change_precision(9),
        Err(BookSyncError::PrecisionOutOfRange {
            precision: 9,
            min: 0,
            max: 4
        })
    );
}

#[tokio::test]
async fn shutdown_stops_the_engine() {
    let (opened_tx, _opened_rx) = mpsc::unbounded_channel();
    let spawned = spawn(Config::default(), ScriptedTransport { opened: opened_tx }).unwrap();
    spawned.handle.shutdown().unwrap();
    spawned.task.await.unwrap();
    assert_eq!(spawned.handle.connect(), Err(BookSyncError::EngineStopped));
}
