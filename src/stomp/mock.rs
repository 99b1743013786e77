//! In-memory broker plumbing for tests.
//!
//! [`DuplexConnector`] hands the broker half of every connection to the test.
//! [`MockSessionFactory`] skips the socket entirely: the test receives the
//! session's command mailbox and injects [`SessionEvent`]s directly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use super::connector::{BoxedStream, Connector};
use super::frame::{Frame, Incoming, Outgoing, StompCodec};
use super::{
    Result, SessionCommand, SessionConfig, SessionEnvelope, SessionEvent, SessionFactory,
    SessionHandle, StompError,
};

/// Connector producing in-memory duplex pipes.
pub struct DuplexConnector {
    brokers: Option<mpsc::UnboundedSender<BrokerSide>>,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerSide>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { brokers: Some(tx) }, rx)
    }

    /// A connector whose every attempt is refused.
    pub fn refusing() -> (Self, mpsc::UnboundedReceiver<BrokerSide>) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (Self { brokers: None }, rx)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let Some(brokers) = &self.brokers else {
            return Err(StompError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        };
        let (client, server) = tokio::io::duplex(64 * 1024);
        brokers
            .send(BrokerSide::new(server))
            .map_err(|_| StompError::Io(std::io::ErrorKind::ConnectionRefused.into()))?;
        Ok(Box::new(client))
    }
}

/// Broker end of a duplex connection.
pub struct BrokerSide {
    framed: Framed<DuplexStream, StompCodec>,
}

impl BrokerSide {
    fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, StompCodec),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed
            .send(Outgoing::Frame(frame))
            .await
            .expect("broker write");
    }

    pub async fn send_heartbeat(&mut self) {
        self.framed
            .send(Outgoing::Heartbeat)
            .await
            .expect("broker write");
    }

    /// Next frame from the client, skipping heartbeats.
    pub async fn expect_frame(&mut self) -> Frame {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("frame timeout")
                .expect("client closed")
                .expect("decode");
            if let Incoming::Frame(frame) = item {
                return frame;
            }
        }
    }
}

/// A session spawned by [`MockSessionFactory`].
pub struct MockSession {
    pub config: SessionConfig,
    pub generation: u64,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub events: mpsc::UnboundedSender<SessionEnvelope>,
}

impl MockSession {
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(SessionEnvelope {
            generation: self.generation,
            event,
        });
    }

    /// Next command, failing the test after a short wait.
    pub async fn next_command(&mut self) -> SessionCommand {
        tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("command timeout")
            .expect("runtime dropped session")
    }

    /// Whether a command arrives within `wait`.
    pub async fn try_next_command(&mut self, wait: Duration) -> Option<SessionCommand> {
        tokio::time::timeout(wait, self.commands.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Session factory handing sessions to the test instead of running them.
#[derive(Default)]
pub struct MockSessionFactory {
    spawned: Mutex<VecDeque<MockSession>>,
    fail_spawn: Mutex<bool>,
}

impl MockSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        *self.fail_spawn.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Oldest session not yet taken.
    pub async fn take_session(&self) -> MockSession {
        for _ in 0..500 {
            if let Some(session) = self
                .spawned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no session spawned");
    }
}

impl SessionFactory for MockSessionFactory {
    fn spawn(
        &self,
        config: SessionConfig,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<SessionHandle> {
        if *self.fail_spawn.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StompError::Tls("Mock spawn failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(MockSession {
                config,
                generation,
                commands: rx,
                events,
            });
        Ok(SessionHandle::new(generation, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::{Command, Credentials};

    fn config() -> SessionConfig {
        SessionConfig::new(
            "broker",
            65001,
            Credentials::ApiKey {
                id: "k".to_string(),
                secret: "s".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_mock_factory_hands_out_sessions() {
        let factory = MockSessionFactory::new();
        let (events, mut rx) = mpsc::unbounded_channel();
        let handle = factory.spawn(config(), 3, events).unwrap();
        assert!(handle.send(SessionCommand::Connect));

        let mut session = factory.take_session().await;
        assert_eq!(session.generation, 3);
        assert_eq!(session.next_command().await, SessionCommand::Connect);

        session.emit(SessionEvent::Connected);
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.generation, 3);
        assert_eq!(envelope.event, SessionEvent::Connected);
    }

    #[tokio::test]
    async fn test_mock_factory_fail_spawn() {
        let factory = MockSessionFactory::new();
        factory.set_fail_spawn(true);
        let (events, _rx) = mpsc::unbounded_channel();
        assert!(factory.spawn(config(), 1, events).is_err());
    }

    #[tokio::test]
    async fn test_duplex_connector_pairs_streams() {
        let (connector, mut brokers) = DuplexConnector::new();
        let stream = connector.connect().await.unwrap();
        let mut client = Framed::new(stream, StompCodec);
        let mut broker = brokers.recv().await.unwrap();

        client
            .send(Outgoing::Frame(Frame::new(Command::Disconnect)))
            .await
            .unwrap();
        assert_eq!(broker.expect_frame().await.command, Command::Disconnect);
    }

    #[tokio::test]
    async fn test_refusing_connector() {
        let (connector, _brokers) = DuplexConnector::refusing();
        assert!(connector.connect().await.is_err());
    }
}
