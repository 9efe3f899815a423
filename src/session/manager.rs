//! Session manager: connection lifecycle and operation orchestration.
//!
//! All mutable session state lives in one task that serializes commands,
//! inbound packets and timer work through a `select!` loop; packet-id
//! allocation and queue mutation can therefore never race. Two auxiliary
//! activities run alongside it: a reader task that decodes inbound bytes
//! and forwards them as events, and the dispatcher worker that invokes
//! subscription handlers off the hot path. [`Session`] is the cheap,
//! cloneable handle callers keep.

use crate::config::{ConfigError, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::protocol::packet::{
    Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, Unsubscribe, Will,
};
use crate::protocol::topics::{validate_filter, validate_publish_topic};
use crate::session::backoff::BackoffController;
use crate::session::dispatch::{Dispatcher, MessageHandler, Publication};
use crate::session::queue::{EnqueueOutcome, OfflineQueue, QueuedMessage};
use crate::session::tracker::{OperationKind, OperationTracker, PendingOperation};
use crate::transport::connector::{Connector, Endpoint, TcpConnector};
use crate::transport::framing::{self, FramedReader, FramedWriter, ReadError};
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often the session task services timers (keep-alive, sweeps,
/// reconnect and drain deadlines).
const TICK: Duration = Duration::from_millis(100);

/// Bound on undelivered publications waiting on subscription handlers.
const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Connection state, published on a watch channel for every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// A caller-initiated connect is in progress.
    Connecting,
    /// Connected; `session_present` echoes the CONNACK flag.
    Connected { session_present: bool },
    /// Connection lost; attempt number of the reconnect in progress or
    /// scheduled.
    Reconnecting { attempt: u32 },
    /// Terminal: the session is tearing down and will not come back.
    ShuttingDown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Future resolved when an operation completes: on the matching ack for
/// QoS 1/2 publishes, subscribes and unsubscribes, on the wire write for
/// QoS 0.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<SessionResult<()>>,
}

impl Delivery {
    fn pending() -> (oneshot::Sender<SessionResult<()>>, Delivery) {
        let (tx, rx) = oneshot::channel();
        (tx, Delivery { rx })
    }
}

impl Future for Delivery {
    type Output = SessionResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(SessionError::cancelled("operation abandoned by session"))
            })
        })
    }
}

enum Command {
    Connect {
        resp: oneshot::Sender<SessionResult<()>>,
    },
    Disconnect {
        resp: oneshot::Sender<SessionResult<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        handler: MessageHandler,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    },
    Unsubscribe {
        filter: String,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    },
    Shutdown {
        resp: oneshot::Sender<SessionResult<()>>,
    },
}

struct ReaderEvent {
    generation: u64,
    kind: ReaderEventKind,
}

enum ReaderEventKind {
    Inbound(Packet),
    Malformed(String),
    ConnectionLost(String),
}

struct SessionShared {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Handle to a running session. Cloning is cheap; all clones drive the same
/// session task. Dropping the last clone aborts the task; call
/// [`Session::shutdown`] for a graceful stop.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionShared>,
}

impl Session {
    /// Create a session for a `mqtt://` endpoint over plain TCP.
    ///
    /// Must be called within a Tokio runtime. `mqtts://` endpoints need a
    /// TLS connector built by the caller; use [`Session::with_connector`].
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        let endpoint = config.endpoint()?;
        if endpoint.tls {
            return Err(SessionError::Config(ConfigError::InvalidConfig(
                "mqtts:// endpoints need a TLS connector; use Session::with_connector".to_string(),
            )));
        }
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a session dialing through the given connector.
    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> SessionResult<Self> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let client_id = config.client_id();

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = SessionTask::new(config, endpoint, client_id, connector, state_tx, event_tx);
        let handle = tokio::spawn(task.run(command_rx, event_rx));

        Ok(Session {
            inner: Arc::new(SessionShared {
                commands: command_tx,
                state_rx,
                task: StdMutex::new(Some(handle)),
            }),
        })
    }

    async fn request<T, F>(&self, make: F) -> SessionResult<T>
    where
        F: FnOnce(oneshot::Sender<SessionResult<T>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Establish the connection. Fails with a connect error on refusal or
    /// timeout; an explicit connect is not retried automatically.
    pub async fn connect(&self) -> SessionResult<()> {
        self.request(|resp| Command::Connect { resp }).await
    }

    /// Send a best-effort DISCONNECT, close the transport and cancel all
    /// outstanding operations. Queued offline messages are kept.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.request(|resp| Command::Disconnect { resp }).await
    }

    /// Publish a message.
    ///
    /// Connected: the message goes to the wire immediately and the returned
    /// [`Delivery`] resolves on the matching acknowledgment (instantly for
    /// QoS 0). Disconnected: the message is queued per the offline-queue
    /// policy and the handle resolves once it is eventually flushed and
    /// acknowledged.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<Delivery> {
        self.request(|resp| Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            resp,
        })
        .await
    }

    /// Subscribe `handler` to every message matching `filter`.
    ///
    /// Requires an established connection. The mapping is provisional until
    /// the SUBACK resolves the returned handle, but matching messages are
    /// dispatched optimistically from the moment of the call.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: impl Fn(Publication) + Send + Sync + 'static,
    ) -> SessionResult<Delivery> {
        self.request(|resp| Command::Subscribe {
            filter: filter.into(),
            qos,
            handler: Arc::new(handler),
            resp,
        })
        .await
    }

    /// Remove a subscription. The handler keeps receiving matching
    /// messages until the UNSUBACK resolves the returned handle.
    pub async fn unsubscribe(&self, filter: impl Into<String>) -> SessionResult<Delivery> {
        self.request(|resp| Command::Unsubscribe {
            filter: filter.into(),
            resp,
        })
        .await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_rx.borrow().clone()
    }

    /// Watch channel receiving every connection-state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Gracefully stop the session: best-effort DISCONNECT, cancel every
    /// outstanding and queued operation, terminate the task.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(|resp| Command::Shutdown { resp }).await?;

        let handle = match self.inner.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!("session task did not stop within grace period");
            }
        }
        Ok(())
    }
}

struct SessionTask {
    config: SessionConfig,
    endpoint: Endpoint,
    client_id: String,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<ReaderEvent>,

    tracker: OperationTracker,
    queue: OfflineQueue,
    dispatcher: Dispatcher,
    backoff: BackoffController,

    writer: Option<FramedWriter>,
    reader_task: Option<JoinHandle<()>>,
    /// Incremented whenever a connection is torn down so events from a
    /// stale reader are ignored.
    generation: u64,
    /// Packet ids of inbound QoS 2 publishes already dispatched but not yet
    /// released by PUBREL.
    incoming_qos2: HashSet<u16>,

    last_write: Instant,
    ping_deadline: Option<Instant>,
    connected_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    drain_at: Option<Instant>,

    connect_timeout: Duration,
    operation_timeout: Duration,
    keep_alive: Duration,
    drain_interval: Duration,
}

impl SessionTask {
    fn new(
        config: SessionConfig,
        endpoint: Endpoint,
        client_id: String,
        connector: Arc<dyn Connector>,
        state_tx: watch::Sender<ConnectionState>,
        event_tx: mpsc::Sender<ReaderEvent>,
    ) -> Self {
        let backoff = BackoffController::from_config(&config.reconnect);
        let queue = OfflineQueue::new(config.queue.policy, config.queue.capacity);
        let connect_timeout = config.connect_timeout();
        let operation_timeout = config.operation_timeout();
        let keep_alive = config.keep_alive();
        let drain_interval = config.drain_interval();

        SessionTask {
            config,
            endpoint,
            client_id,
            connector,
            state_tx,
            event_tx,
            tracker: OperationTracker::new(),
            queue,
            dispatcher: Dispatcher::new(DISPATCH_QUEUE_DEPTH),
            backoff,
            writer: None,
            reader_task: None,
            generation: 0,
            incoming_qos2: HashSet::new(),
            last_write: Instant::now(),
            ping_deadline: None,
            connected_at: None,
            reconnect_at: None,
            reconnect_attempt: 0,
            drain_at: None,
            connect_timeout,
            operation_timeout,
            keep_alive,
            drain_interval,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<ReaderEvent>,
    ) {
        debug!(client_id = %self.client_id, "session task started");
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            // Last handle dropped without an explicit shutdown.
                            self.teardown("session handle dropped").await;
                            break;
                        }
                    }
                }
                maybe_event = events.recv() => {
                    if let Some(event) = maybe_event {
                        self.handle_event(event).await;
                    }
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
            }
        }
        debug!(client_id = %self.client_id, "session task stopped");
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        match (&prev, &next) {
            (_, ConnectionState::Connected { session_present }) => {
                info!(session_present, "connection established");
            }
            (ConnectionState::Connected { .. }, ConnectionState::Reconnecting { attempt }) => {
                warn!(attempt, "connection lost, reconnecting");
            }
            (_, ConnectionState::ShuttingDown) => {
                info!("session shutting down");
            }
            _ => {
                debug!(?prev, ?next, "connection state changed");
            }
        }
        self.state_tx.send_replace(next);
    }

    /// Returns true when the session should terminate.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { resp } => {
                if self.state().is_connected() {
                    let _ = resp.send(Ok(()));
                    return false;
                }
                self.reconnect_at = None;
                match self.try_connect(ConnectionState::Connecting).await {
                    Ok(()) => {
                        self.reconnect_attempt = 0;
                        self.backoff.reset();
                        let _ = resp.send(Ok(()));
                    }
                    Err(e) => {
                        // An explicit connect is not retried automatically.
                        self.set_state(ConnectionState::Disconnected);
                        let _ = resp.send(Err(e));
                    }
                }
                false
            }
            Command::Disconnect { resp } => {
                self.user_disconnect().await;
                let _ = resp.send(Ok(()));
                false
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => {
                self.handle_publish(topic, payload, qos, retain, resp).await;
                false
            }
            Command::Subscribe {
                filter,
                qos,
                handler,
                resp,
            } => {
                self.handle_subscribe(filter, qos, handler, resp).await;
                false
            }
            Command::Unsubscribe { filter, resp } => {
                self.handle_unsubscribe(filter, resp).await;
                false
            }
            Command::Shutdown { resp } => {
                self.teardown("session shut down").await;
                let _ = resp.send(Ok(()));
                true
            }
        }
    }

    async fn handle_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    ) {
        if let Err(e) = validate_publish_topic(&topic) {
            let _ = resp.send(Err(e));
            return;
        }

        let (done, delivery) = Delivery::pending();
        if self.state().is_connected() {
            match self.send_publish(topic, payload, qos, retain, done).await {
                Ok(()) => {
                    let _ = resp.send(Ok(delivery));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            }
            return;
        }

        let message = QueuedMessage {
            topic,
            payload,
            qos,
            retain,
            enqueued_at: Instant::now(),
            done,
        };
        match self.queue.enqueue(message) {
            EnqueueOutcome::Stored => {
                debug!(queued = self.queue.len(), "publish queued while offline");
                let _ = resp.send(Ok(delivery));
            }
            EnqueueOutcome::StoredEvicting(evicted) => {
                warn!(topic = %evicted.topic, "offline queue full, dropped oldest message");
                let _ = evicted
                    .done
                    .send(Err(SessionError::cancelled("evicted by drop-oldest policy")));
                let _ = resp.send(Ok(delivery));
            }
            EnqueueOutcome::Rejected(_rejected) => {
                let _ = resp.send(Err(SessionError::QueueFull {
                    capacity: self.queue.capacity(),
                }));
            }
        }
    }

    /// Write a publish on the live connection, registering QoS 1/2
    /// operations with the tracker first.
    async fn send_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        done: oneshot::Sender<SessionResult<()>>,
    ) -> SessionResult<()> {
        match qos {
            QoS::AtMostOnce => {
                let packet = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id: None,
                    payload,
                });
                if self.write_or_lose(&packet).await {
                    let _ = done.send(Ok(()));
                } else {
                    // QoS 0 in-flight sends are lost on connection drop.
                    let _ = done.send(Err(SessionError::cancelled(
                        "connection lost before the message was written",
                    )));
                }
                Ok(())
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let now = Instant::now();
                let kind = if qos == QoS::AtLeastOnce {
                    OperationKind::PublishQos1
                } else {
                    OperationKind::PublishQos2
                };
                let operation = PendingOperation {
                    kind,
                    submitted_at: now,
                    deadline: now + self.operation_timeout,
                    done,
                    publish: None,
                };
                let id = self
                    .tracker
                    .register(operation)
                    .map_err(|_| SessionError::PacketIdsExhausted)?;

                let publish = Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id: Some(id),
                    payload,
                };
                self.tracker.attach_publish(id, publish.clone());
                // On write failure the tracked operation survives and is
                // retransmitted with DUP after reconnect.
                self.write_or_lose(&Packet::Publish(publish)).await;
                Ok(())
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        filter: String,
        qos: QoS,
        handler: MessageHandler,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    ) {
        if let Err(e) = validate_filter(&filter) {
            let _ = resp.send(Err(e));
            return;
        }
        let state = self.state();
        if !state.is_connected() {
            let _ = resp.send(Err(SessionError::NotConnected { state }));
            return;
        }

        let (done, delivery) = Delivery::pending();
        let now = Instant::now();
        let operation = PendingOperation {
            kind: OperationKind::Subscribe {
                filter: filter.clone(),
            },
            submitted_at: now,
            deadline: now + self.operation_timeout,
            done,
            publish: None,
        };
        match self.tracker.register(operation) {
            Ok(id) => {
                self.dispatcher
                    .insert_provisional(filter.clone(), qos, handler);
                let packet = Packet::Subscribe(Subscribe {
                    packet_id: id,
                    filters: vec![(filter, qos)],
                });
                let _ = resp.send(Ok(delivery));
                self.write_or_lose(&packet).await;
            }
            Err(_) => {
                let _ = resp.send(Err(SessionError::PacketIdsExhausted));
            }
        }
    }

    async fn handle_unsubscribe(
        &mut self,
        filter: String,
        resp: oneshot::Sender<SessionResult<Delivery>>,
    ) {
        if let Err(e) = validate_filter(&filter) {
            let _ = resp.send(Err(e));
            return;
        }
        let state = self.state();
        if !state.is_connected() {
            let _ = resp.send(Err(SessionError::NotConnected { state }));
            return;
        }

        let (done, delivery) = Delivery::pending();
        let now = Instant::now();
        let operation = PendingOperation {
            kind: OperationKind::Unsubscribe {
                filter: filter.clone(),
            },
            submitted_at: now,
            deadline: now + self.operation_timeout,
            done,
            publish: None,
        };
        match self.tracker.register(operation) {
            Ok(id) => {
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id: id,
                    filters: vec![filter],
                });
                let _ = resp.send(Ok(delivery));
                self.write_or_lose(&packet).await;
            }
            Err(_) => {
                let _ = resp.send(Err(SessionError::PacketIdsExhausted));
            }
        }
    }

    // -- connection lifecycle ---------------------------------------------

    async fn try_connect(&mut self, connecting_state: ConnectionState) -> SessionResult<()> {
        self.drop_connection();
        self.set_state(connecting_state);

        let handshake = tokio::time::timeout(self.connect_timeout, self.handshake()).await;
        let (reader, writer, session_present) = match handshake {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SessionError::connect(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };

        self.install_connection(reader, writer);
        self.set_state(ConnectionState::Connected { session_present });
        self.connected_at = Some(Instant::now());

        // Retransmit in-flight QoS 1/2 operations (DUP) before anything else.
        let packets = self.tracker.resendable(Instant::now() + self.operation_timeout);
        for packet in packets {
            debug!(packet = packet.name(), "retransmitting in-flight operation");
            if !self.write_or_lose(&packet).await {
                return Ok(());
            }
        }

        self.resubscribe().await;

        if !self.queue.is_empty() {
            info!(queued = self.queue.len(), "flushing offline queue");
            self.drain_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn handshake(&mut self) -> SessionResult<(FramedReader, FramedWriter, bool)> {
        debug!(endpoint = %self.endpoint, client_id = %self.client_id, "dialing broker");
        let stream = self
            .connector
            .connect(&self.endpoint)
            .await
            .map_err(|e| SessionError::connect(format!("dial {} failed: {e}", self.endpoint)))?;

        let (mut reader, mut writer) =
            framing::split(stream, self.config.session.max_packet_size);

        let (username, password) = self.config.credentials();
        let will = self.config.will.as_ref().map(|w| Will {
            topic: w.topic.clone(),
            payload: Bytes::from(w.payload.clone().into_bytes()),
            qos: QoS::try_from_u8(w.qos).unwrap_or(QoS::AtMostOnce),
            retain: w.retain,
        });
        let connect = Connect {
            client_id: self.client_id.clone(),
            clean_session: self.config.session.clean_session,
            keep_alive_secs: self.config.session.keep_alive_secs,
            will,
            username,
            password,
        };
        writer
            .write_packet(&Packet::Connect(connect))
            .await
            .map_err(|e| SessionError::connect(format!("failed to send CONNECT: {e}")))?;

        match reader.read_packet().await {
            Ok(Packet::ConnAck(ack)) => match ack.code {
                ConnectReturnCode::Accepted => Ok((reader, writer, ack.session_present)),
                code => Err(SessionError::ConnectRefused(code)),
            },
            Ok(other) => Err(SessionError::connect(format!(
                "expected CONNACK, received {}",
                other.name()
            ))),
            Err(e) => Err(SessionError::connect(format!("failed to read CONNACK: {e}"))),
        }
    }

    fn install_connection(&mut self, reader: FramedReader, writer: FramedWriter) {
        let generation = self.generation;
        let events = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match reader.read_packet().await {
                    Ok(packet) => {
                        let event = ReaderEvent {
                            generation,
                            kind: ReaderEventKind::Inbound(packet),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(ReadError::Malformed(reason)) => {
                        let event = ReaderEvent {
                            generation,
                            kind: ReaderEventKind::Malformed(reason),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let event = ReaderEvent {
                            generation,
                            kind: ReaderEventKind::ConnectionLost(e.to_string()),
                        };
                        let _ = events.send(event).await;
                        break;
                    }
                }
            }
        });

        self.reader_task = Some(handle);
        self.writer = Some(writer);
        self.last_write = Instant::now();
        self.ping_deadline = None;
    }

    fn drop_connection(&mut self) {
        if let Some(handle) = self.reader_task.take() {
            handle.abort();
        }
        self.writer = None;
        self.ping_deadline = None;
        self.drain_at = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Write a packet, treating failure as connection loss.
    async fn write_or_lose(&mut self, packet: &Packet) -> bool {
        let Some(mut writer) = self.writer.take() else {
            return false;
        };
        match writer.write_packet(packet).await {
            Ok(()) => {
                self.last_write = Instant::now();
                self.writer = Some(writer);
                true
            }
            Err(e) => {
                self.connection_lost(&format!("write failed: {e}"));
                false
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        if !self.state().is_connected() {
            return;
        }
        warn!(%reason, "connection lost");
        self.drop_connection();

        if let Some(at) = self.connected_at.take() {
            self.backoff.observe_uptime(at.elapsed());
        }
        self.backoff.record_failure();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let next_attempt = self.reconnect_attempt + 1;
        if let Some(max) = self.config.reconnect.max_attempts {
            if self.reconnect_attempt >= max {
                error!(
                    attempts = self.reconnect_attempt,
                    "reconnect attempts exhausted, giving up"
                );
                self.reconnect_at = None;
                self.reconnect_attempt = 0;
                self.tracker.cancel_all("reconnect attempts exhausted");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        }

        let delay = self.backoff.next_delay();
        info!(
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: next_attempt,
        });
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn resubscribe(&mut self) {
        for (filter, qos) in self.dispatcher.filters() {
            let (done, _rx) = oneshot::channel();
            let now = Instant::now();
            let operation = PendingOperation {
                kind: OperationKind::Subscribe {
                    filter: filter.clone(),
                },
                submitted_at: now,
                deadline: now + self.operation_timeout,
                done,
                publish: None,
            };
            match self.tracker.register(operation) {
                Ok(id) => {
                    debug!(%filter, "replaying subscription");
                    let packet = Packet::Subscribe(Subscribe {
                        packet_id: id,
                        filters: vec![(filter, qos)],
                    });
                    if !self.write_or_lose(&packet).await {
                        return;
                    }
                }
                Err(_) => {
                    warn!(%filter, "no packet identifier free to replay subscription");
                    return;
                }
            }
        }
    }

    async fn user_disconnect(&mut self) {
        if self.state().is_connected() {
            // Best effort; DISCONNECT is not acknowledged.
            let _ = self.write_or_lose(&Packet::Disconnect).await;
        }
        self.drop_connection();
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.connected_at = None;
        self.incoming_qos2.clear();
        self.tracker.cancel_all("session disconnected");
        self.set_state(ConnectionState::Disconnected);
        info!("session disconnected");
    }

    async fn teardown(&mut self, reason: &str) {
        self.set_state(ConnectionState::ShuttingDown);
        if self.writer.is_some() {
            let _ = self.write_or_lose(&Packet::Disconnect).await;
        }
        self.drop_connection();
        self.reconnect_at = None;
        self.tracker.cancel_all(reason);
        self.queue.cancel_all(reason);
    }

    // -- timers ------------------------------------------------------------

    async fn on_tick(&mut self) {
        let now = Instant::now();

        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                let attempt = self.reconnect_attempt + 1;
                match self
                    .try_connect(ConnectionState::Reconnecting { attempt })
                    .await
                {
                    Ok(()) => {
                        self.reconnect_attempt = 0;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "reconnect attempt failed");
                        self.reconnect_attempt = attempt;
                        self.backoff.record_failure();
                        self.schedule_reconnect();
                    }
                }
            }
        }

        if self.state().is_connected() {
            if let Some(deadline) = self.ping_deadline {
                if now >= deadline {
                    self.connection_lost("keep-alive ping unanswered");
                }
            } else if !self.keep_alive.is_zero()
                && now.duration_since(self.last_write) >= self.keep_alive
            {
                debug!("sending keep-alive ping");
                if self.write_or_lose(&Packet::PingReq).await {
                    self.ping_deadline = Some(Instant::now() + self.operation_timeout);
                }
            }

            if let Some(at) = self.connected_at {
                if self.backoff.failures() > 0
                    && now.duration_since(at) >= self.backoff.stability_window()
                {
                    debug!("connection stable, backoff reset");
                    self.backoff.reset();
                }
            }
        }

        let connected = self.state().is_connected();
        for (id, kind) in self.tracker.sweep(now, connected) {
            warn!(packet_id = id, ?kind, "operation timed out");
            if let OperationKind::Subscribe { filter } = &kind {
                self.dispatcher.remove_unconfirmed(filter);
            }
        }

        if self.state().is_connected() {
            if let Some(at) = self.drain_at {
                if now >= at {
                    self.drain_one().await;
                }
            }
        }
    }

    /// Flush one queued message, then re-arm the drain timer.
    async fn drain_one(&mut self) {
        let Some(message) = self.queue.pop() else {
            self.drain_at = None;
            return;
        };
        let QueuedMessage {
            topic,
            payload,
            qos,
            retain,
            enqueued_at,
            done,
        } = message;
        debug!(%topic, remaining = self.queue.len(), "flushing queued message");

        match qos {
            QoS::AtMostOnce => {
                let packet = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic: topic.clone(),
                    packet_id: None,
                    payload: payload.clone(),
                });
                if self.write_or_lose(&packet).await {
                    let _ = done.send(Ok(()));
                } else {
                    // Never reached the wire: keep it for the next flush.
                    self.queue.requeue_front(QueuedMessage {
                        topic,
                        payload,
                        qos,
                        retain,
                        enqueued_at,
                        done,
                    });
                    return;
                }
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let now = Instant::now();
                let kind = if qos == QoS::AtLeastOnce {
                    OperationKind::PublishQos1
                } else {
                    OperationKind::PublishQos2
                };
                let operation = PendingOperation {
                    kind,
                    submitted_at: now,
                    deadline: now + self.operation_timeout,
                    done,
                    publish: None,
                };
                match self.tracker.register(operation) {
                    Ok(id) => {
                        let publish = Publish {
                            dup: false,
                            qos,
                            retain,
                            topic,
                            packet_id: Some(id),
                            payload,
                        };
                        self.tracker.attach_publish(id, publish.clone());
                        // Write failure leaves the tracked operation for a
                        // DUP retransmit after reconnect.
                        self.write_or_lose(&Packet::Publish(publish)).await;
                    }
                    Err(operation) => {
                        warn!("no packet identifier free, delaying queue flush");
                        self.queue.requeue_front(QueuedMessage {
                            topic,
                            payload,
                            qos,
                            retain,
                            enqueued_at,
                            done: operation.done,
                        });
                    }
                }
            }
        }

        if self.state().is_connected() {
            self.drain_at = if self.queue.is_empty() {
                None
            } else {
                Some(Instant::now() + self.drain_interval)
            };
        }
    }

    // -- inbound -----------------------------------------------------------

    async fn handle_event(&mut self, event: ReaderEvent) {
        if event.generation != self.generation {
            return;
        }
        match event.kind {
            ReaderEventKind::Inbound(packet) => self.handle_packet(packet).await,
            ReaderEventKind::Malformed(reason) => {
                self.protocol_violation(&format!("malformed packet: {reason}"));
            }
            ReaderEventKind::ConnectionLost(reason) => self.connection_lost(&reason),
        }
    }

    fn protocol_violation(&self, detail: &str) {
        // Logged and ignored; a single bad packet does not drop the
        // connection.
        warn!(%detail, "protocol violation from broker");
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::PubAck { packet_id } => {
                self.resolve_publish_ack(packet_id, "PUBACK", |kind| {
                    matches!(kind, OperationKind::PublishQos1)
                });
            }
            Packet::PubRec { packet_id } => {
                let deadline = Instant::now() + self.operation_timeout;
                if self.tracker.begin_release(packet_id, deadline) {
                    self.write_or_lose(&Packet::PubRel { packet_id }).await;
                } else {
                    self.protocol_violation(&format!("PUBREC for unknown packet id {packet_id}"));
                }
            }
            Packet::PubComp { packet_id } => {
                self.resolve_publish_ack(packet_id, "PUBCOMP", |kind| {
                    matches!(kind, OperationKind::PublishRelease)
                });
            }
            Packet::PubRel { packet_id } => {
                // Inbound QoS 2 release: the message was dispatched on first
                // receipt, this closes the exchange.
                self.incoming_qos2.remove(&packet_id);
                self.write_or_lose(&Packet::PubComp { packet_id }).await;
            }
            Packet::SubAck(ack) => self.handle_suback(ack),
            Packet::UnsubAck { packet_id } => self.handle_unsuback(packet_id),
            Packet::PingResp => {
                self.ping_deadline = None;
            }
            Packet::ConnAck(_) => {
                self.protocol_violation("CONNACK outside connection handshake");
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect => {
                self.protocol_violation(&format!(
                    "client-to-server packet {} from broker",
                    packet.name()
                ));
            }
        }
    }

    async fn handle_inbound_publish(&mut self, publish: Publish) {
        let publication = Publication {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        };
        match publish.qos {
            QoS::AtMostOnce => self.dispatcher.dispatch(publication),
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.protocol_violation("QoS 1 PUBLISH without packet id");
                    return;
                };
                self.dispatcher.dispatch(publication);
                self.write_or_lose(&Packet::PubAck { packet_id }).await;
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.protocol_violation("QoS 2 PUBLISH without packet id");
                    return;
                };
                // Dispatch exactly once: a redelivered PUBLISH for an id we
                // already hold is acknowledged but not re-dispatched.
                if self.incoming_qos2.insert(packet_id) {
                    self.dispatcher.dispatch(publication);
                }
                self.write_or_lose(&Packet::PubRec { packet_id }).await;
            }
        }
    }

    fn resolve_publish_ack(
        &mut self,
        packet_id: u16,
        ack_name: &str,
        kind_matches: impl Fn(&OperationKind) -> bool,
    ) {
        match self.tracker.take(packet_id) {
            Some(operation) if kind_matches(&operation.kind) => {
                let _ = operation.done.send(Ok(()));
            }
            Some(operation) => {
                self.protocol_violation(&format!(
                    "{ack_name} for packet id {packet_id} in state {:?}",
                    operation.kind
                ));
                self.tracker.put_back(packet_id, operation);
            }
            None => {
                self.protocol_violation(&format!("{ack_name} for unknown packet id {packet_id}"));
            }
        }
    }

    fn handle_suback(&mut self, ack: crate::protocol::packet::SubAck) {
        match self.tracker.take(ack.packet_id) {
            Some(operation) => {
                if let OperationKind::Subscribe { filter } = operation.kind.clone() {
                    let rejected = ack.return_codes.is_empty()
                        || ack.return_codes.iter().any(|code| code.is_failure());
                    if rejected {
                        warn!(%filter, "broker rejected subscription");
                        self.dispatcher.remove(&filter);
                        let _ = operation
                            .done
                            .send(Err(SessionError::SubscribeRejected { filter }));
                    } else {
                        debug!(%filter, "subscription confirmed");
                        self.dispatcher.confirm(&filter);
                        let _ = operation.done.send(Ok(()));
                    }
                } else {
                    self.protocol_violation(&format!(
                        "SUBACK for packet id {} in state {:?}",
                        ack.packet_id, operation.kind
                    ));
                    self.tracker.put_back(ack.packet_id, operation);
                }
            }
            None => {
                self.protocol_violation(&format!(
                    "SUBACK for unknown packet id {}",
                    ack.packet_id
                ));
            }
        }
    }

    fn handle_unsuback(&mut self, packet_id: u16) {
        match self.tracker.take(packet_id) {
            Some(operation) => {
                if let OperationKind::Unsubscribe { filter } = operation.kind.clone() {
                    debug!(%filter, "unsubscribe confirmed");
                    self.dispatcher.remove(&filter);
                    let _ = operation.done.send(Ok(()));
                } else {
                    self.protocol_violation(&format!(
                        "UNSUBACK for packet id {packet_id} in state {:?}",
                        operation.kind
                    ));
                    self.tracker.put_back(packet_id, operation);
                }
            }
            None => {
                self.protocol_violation(&format!("UNSUBACK for unknown packet id {packet_id}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_is_connected() {
        assert!(ConnectionState::Connected {
            session_present: false
        }
        .is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_connected());
        assert!(!ConnectionState::ShuttingDown.is_connected());
    }

    #[tokio::test]
    async fn test_delivery_resolves_with_sent_result() {
        let (tx, delivery) = Delivery::pending();
        tx.send(Ok(())).unwrap();
        assert!(delivery.await.is_ok());

        let (tx, delivery) = Delivery::pending();
        tx.send(Err(SessionError::cancelled("test"))).unwrap();
        assert!(matches!(
            delivery.await,
            Err(SessionError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_delivery_dropped_sender_is_cancellation() {
        let (tx, delivery) = Delivery::pending();
        drop(tx);
        assert!(matches!(
            delivery.await,
            Err(SessionError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_session_starts_disconnected() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_new_session_rejects_tls_url_without_connector() {
        let config = SessionConfig::for_url("mqtts://localhost");
        assert!(matches!(
            Session::new(config),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        let result = session.subscribe("a/b", QoS::AtMostOnce, |_| {}).await;
        assert!(matches!(
            result,
            Err(SessionError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_ok() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        assert!(session.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_queues() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        // Unbounded queue: accepted immediately, handle stays pending.
        let delivery = session
            .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await;
        assert!(delivery.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_messages() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        let delivery = session
            .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        session.shutdown().await.unwrap();
        assert!(matches!(
            delivery.await,
            Err(SessionError::Cancelled { .. })
        ));
        assert_eq!(session.state(), ConnectionState::ShuttingDown);

        // Further calls observe the closed session.
        assert!(matches!(
            session.connect().await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_before_queueing() {
        let config = SessionConfig::for_url("mqtt://localhost:1883");
        let session = Session::new(config).unwrap();
        let result = session
            .publish("bad/+/topic", Bytes::new(), QoS::AtMostOnce, false)
            .await;
        assert!(matches!(result, Err(SessionError::InvalidTopic(_))));
    }
}
