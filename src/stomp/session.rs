//! The broker session task.
//!
//! One task per session owns the transport. It alternates between a
//! disconnected phase (waiting for `Connect` or the reconnect timer) and a
//! connected phase (frames in, commands out, heartbeats both ways).

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant, Interval};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::connector::{BoxedStream, Connector, TcpTlsConnector};
use super::frame::{Command, Frame, Incoming, Outgoing, StompCodec, HDR_HEART_BEAT, HDR_MESSAGE};
use super::{
    FatalError, Result, SessionCommand, SessionConfig, SessionEnvelope, SessionEvent,
    SessionFactory, SessionHandle, StompError, HEARTBEAT_RECEIVE_SCALE,
};

type Transport = Framed<BoxedStream, StompCodec>;
type Sink = SplitSink<Transport, Outgoing>;
type Source = SplitStream<Transport>;

/// Error text the broker client reports when the socket closes mid-handshake.
const NO_MORE_DATA: &str = "no more data";
/// Broker error raised while its auth backend is down; the broker drops us and we reconnect.
const AUTH_SERVICE_UNAVAILABLE: &str = "unable to connect to authentication service";
const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Negotiated heartbeat intervals for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeats {
    pub send: Option<Duration>,
    pub receive: Option<Duration>,
}

impl Heartbeats {
    /// Negotiate from our `(cx, cy)` and the broker's `heart-beat: sx,sy`.
    pub fn negotiate(client: Duration, server: Duration, broker: Option<&str>) -> Self {
        let (sx, sy) = broker
            .and_then(|value| value.split_once(','))
            .map(|(a, b)| {
                (
                    a.trim().parse::<u64>().unwrap_or(0),
                    b.trim().parse::<u64>().unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));
        let pick = |ours: Duration, theirs: u64| {
            if ours.is_zero() || theirs == 0 {
                None
            } else {
                Some(ours.max(Duration::from_millis(theirs)))
            }
        };
        Self {
            send: pick(client, sy),
            receive: pick(server, sx).map(|d| d * HEARTBEAT_RECEIVE_SCALE),
        }
    }
}

enum Wake {
    Connect,
    Stop,
}

enum Exit {
    Reconnect(Duration),
    Idle,
    Stop,
}

pub struct BrokerSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    generation: u64,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEnvelope>,
    reconnect_at: Option<Instant>,
    failed_connects: u32,
    no_more_data_errors: u32,
    first_heartbeat_timeout: Option<Instant>,
}

impl BrokerSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        generation: u64,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Self {
        Self {
            config,
            connector,
            generation,
            commands,
            events,
            reconnect_at: None,
            failed_connects: 0,
            no_more_data_errors: 0,
            first_heartbeat_timeout: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(SessionEnvelope {
            generation: self.generation,
            event,
        });
    }

    pub async fn run(mut self) {
        loop {
            match self.wait_disconnected().await {
                Wake::Stop => break,
                Wake::Connect => {}
            }
            match self.connect().await {
                Ok((transport, heartbeats)) => {
                    self.failed_connects = 0;
                    self.no_more_data_errors = 0;
                    info!(
                        host = %self.config.host,
                        port = self.config.port,
                        send_heartbeat = ?heartbeats.send,
                        receive_heartbeat = ?heartbeats.receive,
                        "STOMP connected"
                    );
                    self.emit(SessionEvent::Connected);
                    match self.run_connected(transport, heartbeats).await {
                        Exit::Stop => break,
                        Exit::Idle => self.reconnect_at = None,
                        Exit::Reconnect(delay) => {
                            self.reconnect_at = Some(Instant::now() + delay);
                        }
                    }
                }
                Err(e) => {
                    if let Some(fatal) = self.on_connect_failed(&e) {
                        error!(error = %fatal, "Giving up on STOMP connection");
                        self.emit(SessionEvent::Fatal(fatal));
                        break;
                    }
                }
            }
        }
        debug!(generation = self.generation, "STOMP session stopped");
        self.emit(SessionEvent::Stopped);
    }

    async fn wait_disconnected(&mut self) -> Wake {
        loop {
            let reconnect_at = self.reconnect_at;
            let timer = async move {
                match reconnect_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => return Wake::Stop,
                    Some(SessionCommand::Connect) => {
                        self.reconnect_at = None;
                        return Wake::Connect;
                    }
                    Some(SessionCommand::Disconnect { reconnect, .. }) => {
                        if !reconnect {
                            self.reconnect_at = None;
                        }
                    }
                    Some(SessionCommand::Send(reply)) => self.emit(SessionEvent::SendOutcome {
                        reply,
                        result: Err(StompError::NotConnected.to_string()),
                    }),
                    Some(SessionCommand::Ack(ack)) => self.emit(SessionEvent::AckOutcome {
                        ack,
                        result: Err(StompError::NotConnected.to_string()),
                    }),
                    Some(SessionCommand::Subscribe { destination })
                    | Some(SessionCommand::Unsubscribe { destination }) => {
                        debug!(%destination, "Subscription change deferred until connected");
                    }
                },
                _ = timer => {
                    self.reconnect_at = None;
                    info!(host = %self.config.host, "Reconnecting to STOMP broker");
                    return Wake::Connect;
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(Transport, Heartbeats)> {
        let connect_timeout = self.config.connect_timeout;
        let stream = timeout(connect_timeout, self.connector.connect())
            .await
            .map_err(|_| StompError::Timeout(connect_timeout))??;
        let mut transport = Framed::new(stream, StompCodec);

        let (login, passcode) = self.config.credentials.login();
        let connect = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", self.config.host.clone())
            .with_header("login", login)
            .with_header("passcode", passcode)
            .with_header(
                HDR_HEART_BEAT,
                format!(
                    "{},{}",
                    self.config.client_heartbeat.as_millis(),
                    self.config.server_heartbeat.as_millis()
                ),
            );
        transport.send(Outgoing::Frame(connect)).await?;

        let connected_timeout = self.config.connected_timeout;
        let reply = timeout(connected_timeout, async {
            loop {
                match transport.next().await {
                    Some(Ok(Incoming::Heartbeat)) => continue,
                    Some(Ok(Incoming::Frame(frame))) => return Ok(frame),
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(StompError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            NO_MORE_DATA,
                        )))
                    }
                }
            }
        })
        .await
        .map_err(|_| StompError::Timeout(connected_timeout))??;

        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(StompError::Rejected(error_text(&reply))),
            other => {
                return Err(StompError::Protocol(format!(
                    "expected CONNECTED, got {other}"
                )))
            }
        }

        let heartbeats = Heartbeats::negotiate(
            self.config.client_heartbeat,
            self.config.server_heartbeat,
            reply.header(HDR_HEART_BEAT),
        );
        Ok((transport, heartbeats))
    }

    /// Record a failed connect. Returns the fatal error once a limit is reached.
    fn on_connect_failed(&mut self, e: &StompError) -> Option<FatalError> {
        self.failed_connects += 1;
        let reason = e.to_string();

        if reason.to_lowercase().contains(NO_MORE_DATA) {
            self.no_more_data_errors += 1;
            let max = self.config.max_connection_errors;
            if max > 0 && self.no_more_data_errors >= max {
                return Some(FatalError::ConnectionErrors(self.no_more_data_errors));
            }
        }
        if let StompError::Rejected(message) = e {
            if self.config.is_unrecoverable(message) {
                return Some(FatalError::Unrecoverable(message.clone()));
            }
        }
        let max_retries = self.config.max_connection_retries;
        if max_retries > 0 && self.failed_connects >= max_retries as u32 {
            return Some(FatalError::ConnectionRetries(self.failed_connects));
        }

        warn!(
            error = %reason,
            attempt = self.failed_connects,
            retry_in = ?self.config.reconnect_delay,
            "STOMP connection failed"
        );
        self.emit(SessionEvent::ConnectionFailed { reason });
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        None
    }

    async fn run_connected(&mut self, transport: Transport, heartbeats: Heartbeats) -> Exit {
        let (mut sink, mut source): (Sink, Source) = transport.split();
        let mut last_received = Instant::now();
        let mut send_tick = heartbeats
            .send
            .map(|d| tokio::time::interval_at(Instant::now() + d, d));
        let reconnect_delay = self.config.reconnect_delay;

        loop {
            let receive_deadline = heartbeats.receive.map(|d| last_received + d);
            tokio::select! {
                item = source.next() => match item {
                    Some(Ok(incoming)) => {
                        last_received = Instant::now();
                        self.first_heartbeat_timeout = None;
                        if let Incoming::Frame(frame) = incoming {
                            if let Some(exit) = self.on_frame(frame) {
                                return exit;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "STOMP connection lost");
                        self.emit(SessionEvent::Disconnected { reconnect: true });
                        return Exit::Reconnect(reconnect_delay);
                    }
                    None => {
                        warn!("STOMP broker closed the connection");
                        self.emit(SessionEvent::Disconnected { reconnect: true });
                        return Exit::Reconnect(reconnect_delay);
                    }
                },
                command = self.commands.recv() => {
                    let command = command.unwrap_or(SessionCommand::Shutdown);
                    match command {
                        SessionCommand::Shutdown => {
                            self.drain(&mut sink).await;
                            close(&mut sink, &mut source).await;
                            info!("STOMP session shut down");
                            self.emit(SessionEvent::Disconnected { reconnect: false });
                            return Exit::Stop;
                        }
                        SessionCommand::Disconnect { flush, reconnect } => {
                            if flush {
                                self.drain(&mut sink).await;
                            }
                            close(&mut sink, &mut source).await;
                            info!(reconnect, "STOMP disconnected on request");
                            self.emit(SessionEvent::Disconnected { reconnect });
                            return if reconnect {
                                Exit::Reconnect(reconnect_delay)
                            } else {
                                Exit::Idle
                            };
                        }
                        SessionCommand::Connect => debug!("Connect requested while connected"),
                        other => {
                            if let Err(e) = self.execute(&mut sink, other).await {
                                warn!(error = %e, "STOMP write failed");
                                self.emit(SessionEvent::Disconnected { reconnect: true });
                                return Exit::Reconnect(reconnect_delay);
                            }
                        }
                    }
                },
                _ = tick(&mut send_tick) => {
                    if let Err(e) = sink.send(Outgoing::Heartbeat).await {
                        warn!(error = %e, "STOMP heartbeat write failed");
                        self.emit(SessionEvent::Disconnected { reconnect: true });
                        return Exit::Reconnect(reconnect_delay);
                    }
                },
                _ = deadline(receive_deadline) => {
                    return self.on_heartbeat_timeout();
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Option<Exit> {
        match frame.command {
            Command::Message => self.emit(SessionEvent::Message(frame)),
            Command::Error => {
                let message = error_text(&frame);
                if self.config.is_unrecoverable(&message) {
                    error!(%message, "Unrecoverable STOMP error");
                    self.emit(SessionEvent::Fatal(FatalError::Unrecoverable(message)));
                    return Some(Exit::Stop);
                }
                if message.to_lowercase().contains(AUTH_SERVICE_UNAVAILABLE) {
                    info!(%message, "Broker authentication service unavailable; awaiting reconnect");
                } else {
                    warn!(%message, "STOMP error frame");
                    self.emit(SessionEvent::BrokerError { message });
                }
            }
            Command::Receipt => debug!(receipt = ?frame.header("receipt-id"), "STOMP receipt"),
            other => debug!(command = %other, "Ignoring unexpected STOMP frame"),
        }
        None
    }

    fn on_heartbeat_timeout(&mut self) -> Exit {
        let now = Instant::now();
        let first = *self.first_heartbeat_timeout.get_or_insert(now);
        error!("STOMP heartbeat timeout");
        self.emit(SessionEvent::HeartbeatTimeout);

        if let Some(threshold) = self.config.heartbeat_timeout_threshold {
            let elapsed = now.duration_since(first);
            if elapsed > threshold {
                let fatal = FatalError::HeartbeatThreshold { threshold, elapsed };
                error!("{fatal}, exiting...");
                self.emit(SessionEvent::Fatal(fatal));
                return Exit::Stop;
            }
        }
        warn!("Trying to reconnect after STOMP HeartbeatTimeout");
        self.emit(SessionEvent::Disconnected { reconnect: true });
        Exit::Reconnect(Duration::ZERO)
    }

    /// Write one outbound command, reporting send/ack outcomes.
    ///
    /// Returns the write error when the transport is broken.
    async fn execute(&mut self, sink: &mut Sink, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Subscribe { destination } => {
                let mut frame = Frame::new(Command::Subscribe)
                    .with_header("destination", wire_destination(&destination))
                    .with_header("id", destination.clone())
                    .with_header("ack", "client-individual");
                if let Some(prefetch) = self.config.prefetch_limit {
                    frame = frame.with_header("activemq.prefetchSize", prefetch.to_string());
                }
                sink.send(Outgoing::Frame(frame)).await?;
                info!(%destination, "Subscribed");
            }
            SessionCommand::Unsubscribe { destination } => {
                let frame = Frame::new(Command::Unsubscribe).with_header("id", destination.clone());
                sink.send(Outgoing::Frame(frame)).await?;
                info!(%destination, "Unsubscribed");
            }
            SessionCommand::Send(reply) => {
                let result = sink.send(Outgoing::Frame(reply.to_frame())).await;
                let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                debug!(message_id = %reply.message_id, kind = ?reply.kind, ok = outcome.is_ok(), "Reply sent");
                self.emit(SessionEvent::SendOutcome {
                    reply,
                    result: outcome,
                });
                result?;
            }
            SessionCommand::Ack(ack) => {
                let result = sink.send(Outgoing::Frame(ack.to_frame())).await;
                let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                debug!(message_id = %ack.message_id, ok = outcome.is_ok(), "Ack sent");
                self.emit(SessionEvent::AckOutcome {
                    ack,
                    result: outcome,
                });
                result?;
            }
            SessionCommand::Connect
            | SessionCommand::Disconnect { .. }
            | SessionCommand::Shutdown => {}
        }
        Ok(())
    }

    /// Write every queued outbound command before disconnecting.
    async fn drain(&mut self, sink: &mut Sink) {
        while let Ok(command) = self.commands.try_recv() {
            if let Err(e) = self.execute(sink, command).await {
                warn!(error = %e, "STOMP write failed while flushing");
                self.fail_queued();
                return;
            }
        }
    }

    fn fail_queued(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Send(reply) => self.emit(SessionEvent::SendOutcome {
                    reply,
                    result: Err(StompError::NotConnected.to_string()),
                }),
                SessionCommand::Ack(ack) => self.emit(SessionEvent::AckOutcome {
                    ack,
                    result: Err(StompError::NotConnected.to_string()),
                }),
                _ => {}
            }
        }
    }
}

/// Send DISCONNECT and wait briefly for the broker's receipt.
async fn close(sink: &mut Sink, source: &mut Source) {
    let receipt = uuid::Uuid::new_v4().to_string();
    let frame = Frame::new(Command::Disconnect).with_header("receipt", receipt.clone());
    if sink.send(Outgoing::Frame(frame)).await.is_err() {
        return;
    }
    let _ = timeout(DISCONNECT_RECEIPT_TIMEOUT, async {
        while let Some(Ok(item)) = source.next().await {
            if let Incoming::Frame(frame) = item {
                if frame.command == Command::Receipt
                    && frame.header("receipt-id") == Some(receipt.as_str())
                {
                    break;
                }
            }
        }
    })
    .await;
    let _ = sink.close().await;
}

fn error_text(frame: &Frame) -> String {
    match frame.header(HDR_MESSAGE) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => String::from_utf8_lossy(&frame.body).trim().to_string(),
    }
}

/// Destinations go on the wire with a leading slash.
fn wire_destination(destination: &str) -> String {
    if destination.starts_with('/') {
        destination.to_string()
    } else {
        format!("/{destination}")
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawns [`BrokerSession`]s over TCP + TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct StompSessionFactory;

impl SessionFactory for StompSessionFactory {
    fn spawn(
        &self,
        config: SessionConfig,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<SessionHandle> {
        let connector = TcpTlsConnector::new(&config)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = BrokerSession::new(config, Arc::new(connector), generation, rx, events);
        tokio::spawn(session.run());
        Ok(SessionHandle::new(generation, tx))
    }
}
