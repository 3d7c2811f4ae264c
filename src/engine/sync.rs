//! Connection and subscription state machine

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use super::{Command, ConnectionStatus, EngineEvent, EngineWarning};
use crate::config::Config;
use crate::error::{BookSyncError, Result};
use crate::orderbook::{BookStore, SubscriptionParams};
use crate::parser::{decode, encode_subscribe, ChannelId, ProtocolEvent};
use crate::telemetry;
use crate::websocket::{FeedConnection, FeedTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Transport requested, waiting for it to open
    Connecting,
    /// Subscribe sent, waiting for the channel id
    AwaitingAck,
    Subscribed,
    /// Close sent, waiting for the transport to confirm it
    Closing { reopen: bool },
    Disconnected,
    Stalled,
}

/// Engine state, owned by a single task
pub struct SyncEngine<T: FeedTransport> {
    config: Config,
    transport: T,
    params: SubscriptionParams,
    book: BookStore,
    phase: Phase,
    connection: Option<FeedConnection>,
    channel_id: Option<ChannelId>,
    /// Incremented for every opened connection
    epoch: u64,
    /// Book data applied since the connection opened
    has_data: bool,
    opened_at: Option<Instant>,
    loading_deadline: Option<Instant>,
    /// Hard failure if no book data arrives; untouched by heartbeats
    data_deadline: Option<Instant>,
    /// Armed once data flows; diffs and heartbeats push it back
    liveness_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl<T: FeedTransport> SyncEngine<T> {
    pub(crate) fn new(
        config: Config,
        transport: T,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<EngineEvent>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let params = config.initial_params();
        Self {
            book: BookStore::new(&params),
            params,
            config,
            transport,
            phase: Phase::Idle,
            connection: None,
            channel_id: None,
            epoch: 0,
            has_data: false,
            opened_at: None,
            loading_deadline: None,
            data_deadline: None,
            liveness_deadline: None,
            close_deadline: None,
            commands,
            events,
            status,
        }
    }

    /// Process commands, transport events and deadlines until shutdown
    pub async fn run(mut self) {
        info!(
            symbol = %self.params.symbol,
            precision = self.params.precision,
            "Sync engine started"
        );

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = next_event(&mut self.connection) => self.handle_transport_event(event),
                _ = sleep_until_opt(deadline) => self.handle_deadline(),
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        info!(symbol = %self.params.symbol, "Sync engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, phase = ?self.phase, "Handling command");

        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => self.resubscribe(),
            Command::ChangePrecision(precision) => {
                if let Err(e) = self.config.check_precision(precision) {
                    warn!(error = %e, "Ignoring precision change");
                    return;
                }
                self.params = self.params.with_precision(precision);
                self.resubscribe();
            }
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self) {
        match self.phase {
            Phase::Idle | Phase::Disconnected | Phase::Stalled => self.open_connection(),
            Phase::Closing { .. } => {
                self.phase = Phase::Closing { reopen: true };
                self.set_status(ConnectionStatus::Connecting);
            }
            Phase::Connecting | Phase::AwaitingAck | Phase::Subscribed => {
                debug!(epoch = self.epoch, "Connection already active, ignoring connect");
            }
        }
    }

    fn disconnect(&mut self) {
        match self.phase {
            Phase::Connecting | Phase::AwaitingAck | Phase::Subscribed => self.begin_close(false),
            Phase::Closing { .. } => self.phase = Phase::Closing { reopen: false },
            Phase::Idle | Phase::Stalled | Phase::Disconnected => self.phase = Phase::Disconnected,
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Tear down the current subscription, if any, then subscribe with `self.params`
    fn resubscribe(&mut self) {
        info!(
            symbol = %self.params.symbol,
            precision = self.params.precision,
            phase = ?self.phase,
            "Resubscribing"
        );

        match self.phase {
            Phase::Idle | Phase::Disconnected | Phase::Stalled => self.open_connection(),
            Phase::Closing { .. } => {
                self.phase = Phase::Closing { reopen: true };
                self.set_status(ConnectionStatus::Connecting);
            }
            Phase::Connecting | Phase::AwaitingAck | Phase::Subscribed => {
                self.set_status(ConnectionStatus::Connecting);
                self.begin_close(true);
            }
        }
    }

    fn open_connection(&mut self) {
        self.epoch += 1;
        self.channel_id = None;
        self.has_data = false;

        let had_levels = !self.book.is_empty();
        self.book.reset(&self.params, self.epoch);

        let now = Instant::now();
        self.opened_at = Some(now);
        self.loading_deadline = Some(now + self.config.loading_timeout());
        self.data_deadline = Some(now + self.config.stale_timeout());
        self.liveness_deadline = None;
        self.close_deadline = None;

        self.connection = Some(self.transport.open());
        self.phase = Phase::Connecting;
        telemetry::CONNECTIONS_OPENED
            .with_label_values(&[self.params.symbol.as_str()])
            .inc();

        info!(
            symbol = %self.params.symbol,
            precision = self.params.precision,
            epoch = self.epoch,
            "Opening feed connection"
        );

        self.set_status(ConnectionStatus::Connecting);
        if had_levels {
            self.publish_snapshot();
        }
    }

    /// Ask the transport to close and hold off until it confirms
    fn begin_close(&mut self, reopen: bool) {
        self.clear_timers();
        self.channel_id = None;
        self.phase = Phase::Closing { reopen };

        let Some(connection) = self.connection.as_ref() else {
            self.finish_close();
            return;
        };
        connection.close();
        self.close_deadline = Some(Instant::now() + self.config.close_timeout());
    }

    fn finish_close(&mut self) {
        self.close_deadline = None;
        self.connection = None;

        match self.phase {
            Phase::Closing { reopen: true } => self.open_connection(),
            _ => {
                self.phase = match *self.status.borrow() {
                    ConnectionStatus::Stalled => Phase::Stalled,
                    _ => Phase::Disconnected,
                };
            }
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        let event = event.unwrap_or(TransportEvent::Closed);

        if let Phase::Closing { .. } = self.phase {
            match event {
                TransportEvent::Closed | TransportEvent::Error(_) => {
                    debug!(epoch = self.epoch, "Transport confirmed close");
                    self.finish_close();
                }
                _ => trace!(epoch = self.epoch, "Discarding event from closing connection"),
            }
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Closed => self.on_connection_lost("connection closed".to_string(), false),
            TransportEvent::Error(e) => self.on_connection_lost(e, false),
        }
    }

    fn on_open(&mut self) {
        if self.phase != Phase::Connecting {
            debug!(phase = ?self.phase, "Ignoring unexpected open event");
            return;
        }

        match self.send_subscribe() {
            Ok(()) => {
                self.phase = Phase::AwaitingAck;
                debug!(epoch = self.epoch, "Subscribe request sent");
            }
            Err(e) => self.on_connection_lost(e.to_string(), true),
        }
    }

    fn send_subscribe(&self) -> Result<()> {
        let request = encode_subscribe(&self.params)?;
        match &self.connection {
            Some(connection) => connection.send(request),
            None => Err(BookSyncError::Transport("no open connection".to_string())),
        }
    }

    fn on_message(&mut self, text: &str) {
        match decode(text, self.channel_id) {
            Ok(ProtocolEvent::SubscribedAck {
                channel_id,
                precision,
                ..
            }) => self.on_subscribed(channel_id, precision),
            Ok(ProtocolEvent::Heartbeat) => {
                trace!(channel_id = ?self.channel_id, "Heartbeat");
                self.rearm_liveness();
            }
            Ok(ProtocolEvent::LevelDiff { diff, .. }) => {
                let result = self.book.apply_diff(&diff);
                self.after_update(result, 1);
            }
            Ok(ProtocolEvent::Snapshot { diffs, .. }) => {
                let result = self.book.apply_batch(&diffs);
                self.after_update(result, diffs.len());
            }
            Ok(ProtocolEvent::Info { code, version }) => {
                info!(code = ?code, version = ?version, "Feed info");
            }
            Ok(ProtocolEvent::Error { code, msg }) => {
                let error = BookSyncError::ProtocolError { code, msg };
                self.on_connection_lost(error.to_string(), true);
            }
            Ok(ProtocolEvent::Unrecognized) => {
                telemetry::IGNORED_FRAMES
                    .with_label_values(&[self.params.symbol.as_str()])
                    .inc();
                trace!(channel_id = ?self.channel_id, "Ignoring frame");
            }
            Err(e @ BookSyncError::MalformedDiff(_)) => self.on_malformed(e),
            Err(e) => {
                warn!(error = %e, "Failed to decode frame");
                self.emit(EngineEvent::Warning(EngineWarning::Decode(e.to_string())));
            }
        }
    }

    fn on_subscribed(&mut self, channel_id: ChannelId, precision: Option<u8>) {
        if self.phase != Phase::AwaitingAck {
            debug!(channel_id, phase = ?self.phase, "Ignoring unexpected subscription ack");
            return;
        }
        if precision.is_some_and(|p| p != self.params.precision) {
            warn!(
                channel_id,
                requested = self.params.precision,
                acknowledged = ?precision,
                "Acknowledged precision differs from request"
            );
        }

        self.channel_id = Some(channel_id);
        self.phase = Phase::Subscribed;
        self.data_deadline = Some(Instant::now() + self.config.stale_timeout());

        info!(
            symbol = %self.params.symbol,
            precision = self.params.precision,
            channel_id,
            epoch = self.epoch,
            "Subscribed to book channel"
        );
        self.set_status(ConnectionStatus::Subscribed);
    }

    fn after_update(&mut self, result: Result<()>, levels: usize) {
        match result {
            Ok(()) => {
                telemetry::DIFFS_APPLIED
                    .with_label_values(&[self.params.symbol.as_str()])
                    .inc_by(levels as u64);
                if !self.has_data {
                    self.has_data = true;
                    self.loading_deadline = None;
                    self.data_deadline = None;
                    info!(epoch = self.epoch, "First book data received");
                }
                self.rearm_liveness();
                self.publish_snapshot();
            }
            Err(e) => self.on_malformed(e),
        }
    }

    fn on_malformed(&self, error: BookSyncError) {
        telemetry::MALFORMED_DIFFS
            .with_label_values(&[self.params.symbol.as_str()])
            .inc();
        warn!(error = %error, epoch = self.epoch, "Dropping malformed diff");
        self.emit(EngineEvent::Warning(EngineWarning::MalformedDiff(error.to_string())));
    }

    /// The connection failed underneath us; `close` asks a still-open transport to go away
    fn on_connection_lost(&mut self, reason: String, close: bool) {
        warn!(epoch = self.epoch, reason = %reason, "Feed connection lost");

        if let Some(connection) = self.connection.take() {
            if close {
                connection.close();
            }
        }
        self.channel_id = None;
        self.clear_timers();
        self.phase = Phase::Disconnected;

        self.emit(EngineEvent::Warning(EngineWarning::Transport(reason)));
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn handle_deadline(&mut self) {
        let now = Instant::now();

        if self.close_deadline.is_some_and(|d| d <= now) {
            warn!(epoch = self.epoch, "Transport did not confirm close, dropping it");
            self.finish_close();
            return;
        }

        let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| d <= now);
        if expired(self.data_deadline) || expired(self.liveness_deadline) {
            self.on_stall();
            return;
        }

        if self.loading_deadline.is_some_and(|d| d <= now) {
            self.loading_deadline = None;
            let waited_ms = self
                .opened_at
                .map(|t| now.duration_since(t).as_millis() as u64)
                .unwrap_or_default();
            warn!(epoch = self.epoch, waited_ms, "No book data yet");
            self.emit(EngineEvent::Warning(EngineWarning::LoadingSlow { waited_ms }));
        }
    }

    fn on_stall(&mut self) {
        telemetry::STALLS
            .with_label_values(&[self.params.symbol.as_str()])
            .inc();
        warn!(
            symbol = %self.params.symbol,
            epoch = self.epoch,
            phase = ?self.phase,
            received_data = self.has_data,
            "Feed stalled, forcing disconnect"
        );
        self.begin_close(false);
        self.set_status(ConnectionStatus::Stalled);
    }

    /// Only a feed that has delivered book data has liveness to keep up
    fn rearm_liveness(&mut self) {
        if self.has_data {
            self.liveness_deadline = Some(Instant::now() + self.config.stale_timeout());
        }
    }

    fn clear_timers(&mut self) {
        self.loading_deadline = None;
        self.data_deadline = None;
        self.liveness_deadline = None;
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.loading_deadline,
            self.data_deadline,
            self.liveness_deadline,
            self.close_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn publish_snapshot(&self) {
        self.emit(EngineEvent::Snapshot(self.book.snapshot(self.config.top_n)));
    }

    fn set_status(&self, status: ConnectionStatus) {
        if *self.status.borrow() == status {
            return;
        }
        self.status.send_replace(status);
        telemetry::CONNECTION_STATUS
            .with_label_values(&[self.params.symbol.as_str()])
            .set(status.gauge_value());
        self.emit(EngineEvent::Status(status));
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            trace!("Event consumer has gone away");
        }
    }
}

async fn next_event(connection: &mut Option<FeedConnection>) -> Option<TransportEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
