//! Broker session over STOMP 1.2.
//!
//! The session is a task that owns the socket. Everything else talks to it
//! through [`SessionCommand`]s and observes it through [`SessionEvent`]s.
//! Send and ack outcomes are always reported back, connected or not, so
//! the delivery guard sees every failure.

pub mod connector;
pub mod frame;
pub mod mock;
pub mod session;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

pub use connector::{BoxedStream, Connector, TcpTlsConnector};
pub use frame::{Command, Frame, Incoming, Outgoing, StompCodec};
pub use session::{BrokerSession, StompSessionFactory};

/// Default broker port.
pub const DEFAULT_STOMP_PORT: u16 = 65001;
/// Default server-to-client heartbeat.
pub const DEFAULT_SERVER_HEARTBEAT: Duration = Duration::from_millis(15_000);
/// Missing heartbeats tolerated before the connection is considered dead.
pub const HEARTBEAT_RECEIVE_SCALE: u32 = 2;
/// Default delay before reconnecting after a disconnect or failed connect.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Process exit code used when heartbeat timeouts persist past the threshold.
pub const HEARTBEAT_THRESHOLD_EXIT_CODE: i32 = 34;

/// Errors from the STOMP layer.
#[derive(Debug, thiserror::Error)]
pub enum StompError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, StompError>;

/// Broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    UserPassword { user: String, password: String },
    ApiKey { id: String, secret: String },
}

impl Credentials {
    /// `(login, passcode)` for the CONNECT frame.
    pub fn login(&self) -> (&str, &str) {
        match self {
            Credentials::UserPassword { user, password } => (user, password),
            Credentials::ApiKey { id, secret } => (id, secret),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Credentials::ApiKey { id, .. } => f
                .debug_struct("ApiKey")
                .field("id", id)
                .field("secret", &"***")
                .finish(),
        }
    }
}

/// How the broker certificate is verified.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsTrust {
    /// Bundled web PKI roots.
    #[default]
    WebPki,
    /// PEM trust store on disk.
    CaFile(PathBuf),
    /// Accept any certificate.
    NoVerification,
}

/// Upstream HTTP proxy tunnelled with CONNECT.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Immutable per-session connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tls: TlsTrust,
    pub proxy: Option<ProxyConfig>,
    /// Client-to-server heartbeat; zero disables.
    pub client_heartbeat: Duration,
    /// Server-to-client heartbeat requested; zero disables.
    pub server_heartbeat: Duration,
    pub connect_timeout: Duration,
    pub connected_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Consecutive failed connects tolerated; zero or negative is unbounded.
    pub max_connection_retries: i32,
    /// "no more data" connect failures tolerated; zero disables the check.
    pub max_connection_errors: u32,
    /// Lowercased substrings of broker errors that end the process.
    pub unrecoverable_errors: Vec<String>,
    pub heartbeat_timeout_threshold: Option<Duration>,
    pub prefetch_limit: Option<u32>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            tls: TlsTrust::default(),
            proxy: None,
            client_heartbeat: Duration::ZERO,
            server_heartbeat: DEFAULT_SERVER_HEARTBEAT,
            connect_timeout: Duration::from_secs(60),
            connected_timeout: Duration::from_secs(60),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_connection_retries: -1,
            max_connection_errors: 3,
            unrecoverable_errors: vec!["already subscribed".to_string()],
            heartbeat_timeout_threshold: None,
            prefetch_limit: Some(20),
        }
    }

    pub fn is_unrecoverable(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.unrecoverable_errors
            .iter()
            .any(|needle| !needle.is_empty() && message.contains(needle.as_str()))
    }
}

/// Final replies are guarded; interim status replies are best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Interim,
    Final,
}

/// A reply frame bound for the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    /// Message-id of the invocation this reply answers.
    pub message_id: String,
    pub destination: String,
    pub correlation_id: Option<String>,
    pub body: String,
    pub kind: ReplyKind,
}

impl OutboundReply {
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new(Command::Send)
            .with_header(frame::HDR_DESTINATION, self.destination.clone())
            .with_header("content-type", "application/json");
        if let Some(correlation) = &self.correlation_id {
            frame = frame.with_header(frame::HDR_CORRELATION_ID, correlation.clone());
        }
        frame.with_body(self.body.clone().into_bytes())
    }
}

/// An acknowledgement of a delivered frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAck {
    pub message_id: String,
    pub frame: Frame,
}

impl OutboundAck {
    pub fn new(message_id: impl Into<String>, frame: Frame) -> Self {
        Self {
            message_id: message_id.into(),
            frame,
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(Command::Ack).with_header(
            frame::HDR_ID,
            self.frame.ack_id().unwrap_or(&self.message_id).to_string(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Connect,
    Disconnect { flush: bool, reconnect: bool },
    Subscribe { destination: String },
    Unsubscribe { destination: String },
    Send(OutboundReply),
    Ack(OutboundAck),
    Shutdown,
}

/// Why the session gave up for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Broker error frame matching the unrecoverable list.
    Unrecoverable(String),
    /// Heartbeat timeouts persisted past the configured threshold.
    HeartbeatThreshold { threshold: Duration, elapsed: Duration },
    /// Too many "no more data" connect failures.
    ConnectionErrors(u32),
    /// Too many consecutive failed connects.
    ConnectionRetries(u32),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::HeartbeatThreshold { .. } => HEARTBEAT_THRESHOLD_EXIT_CODE,
            _ => 1,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Unrecoverable(message) => {
                write!(f, "unrecoverable broker error: {message}")
            }
            FatalError::HeartbeatThreshold { threshold, elapsed } => write!(
                f,
                "'heartbeat_timeout_threshold' is set to '{}s' and '{}s' have passed since the first HeartbeatTimeout",
                threshold.as_secs(),
                elapsed.as_secs()
            ),
            FatalError::ConnectionErrors(count) => {
                write!(f, "{count} consecutive 'no more data' connection errors")
            }
            FatalError::ConnectionRetries(count) => {
                write!(f, "{count} consecutive failed connection attempts")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reconnect: bool },
    ConnectionFailed { reason: String },
    HeartbeatTimeout,
    Message(Frame),
    BrokerError { message: String },
    Fatal(FatalError),
    SendOutcome {
        reply: OutboundReply,
        result: std::result::Result<(), String>,
    },
    AckOutcome {
        ack: OutboundAck,
        result: std::result::Result<(), String>,
    },
    Stopped,
}

/// A session event tagged with the generation of the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub generation: u64,
    pub event: SessionEvent,
}

/// Sending half of a running session's mailbox.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(generation: u64, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self {
            generation,
            commands,
        }
    }

    /// Enqueue a command. Returns false when the session task is gone.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Builds sessions. The runtime asks for a fresh one on every reload.
pub trait SessionFactory: Send + Sync {
    fn spawn(
        &self,
        config: SessionConfig,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<SessionHandle>;
}

impl<T: SessionFactory + ?Sized> SessionFactory for Arc<T> {
    fn spawn(
        &self,
        config: SessionConfig,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<SessionHandle> {
        (**self).spawn(config, generation, events)
    }
}
