//! Shared utilities for integration tests.
//!
//! Runs a [`Runtime`] against an in-memory platform and a mock broker
//! session, so a test drives the broker side command by command.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use soarlink::config::Config;
use soarlink::rest::mock::MockPlatform;
use soarlink::rest::{OrgContext, PlatformMetadata};
use soarlink::stomp::mock::{MockSession, MockSessionFactory};
use soarlink::stomp::{Command, Frame, OutboundAck, OutboundReply, SessionCommand, SessionEvent};
use soarlink::{Component, Runtime, RuntimeError, RuntimeHandle};

pub const ORG_ID: i64 = 201;
pub const REPLY_TO: &str = "R";
pub const CORRELATION_ID: &str = "c1";

/// Config with API key credentials and a one second retry tick.
pub fn config() -> Config {
    let mut config = Config::default();
    config.options.host = "platform.test".to_string();
    config.options.api_key_id = Some("key".to_string());
    config.options.api_key_secret = Some("secret".to_string());
    config.options.stomp_timer_interval = 1;
    config.options.num_workers = 4;
    config
}

pub fn org() -> OrgContext {
    OrgContext {
        org_id: ORG_ID,
        org_name: "Acme".to_string(),
        actions_enabled: true,
    }
}

/// Action 42 is "Run: Something"; function `fn_sum` lives on `fn_queue`.
pub fn metadata() -> PlatformMetadata {
    PlatformMetadata {
        org_id: ORG_ID,
        actions_enabled: true,
        action_names: HashMap::from([(42, "Run: Something".to_string())]),
        function_destinations: HashMap::from([("fn_sum".to_string(), "fn_queue".to_string())]),
        low_code_destinations: vec!["lc.201.forms".to_string()],
        ..Default::default()
    }
}

/// A delivered MESSAGE frame with the usual reply headers.
pub fn message(message_id: &str, subscription: &str, payload: &Value) -> Frame {
    Frame::new(Command::Message)
        .with_header("message-id", message_id)
        .with_header("reply-to", REPLY_TO)
        .with_header("correlation-id", CORRELATION_ID)
        .with_header("subscription", subscription)
        .with_header("destination", format!("/queue/{subscription}"))
        .with_body(payload.to_string().into_bytes())
}

pub fn body(reply: &OutboundReply) -> Value {
    serde_json::from_str(&reply.body).expect("reply body is JSON")
}

pub struct Harness {
    pub handle: RuntimeHandle,
    pub platform: Arc<MockPlatform>,
    pub factory: Arc<MockSessionFactory>,
    pub session: MockSession,
    /// Destinations subscribed by the latest connect.
    pub subscriptions: Vec<String>,
    pub task: JoinHandle<Result<(), RuntimeError>>,
}

impl Harness {
    /// Start a runtime with `components`, connect the broker and consume the
    /// initial subscriptions.
    pub async fn start(components: Vec<Component>) -> Self {
        Self::start_with(config(), components).await
    }

    pub async fn start_with(config: Config, components: Vec<Component>) -> Self {
        let platform = Arc::new(MockPlatform::new());
        let factory = MockSessionFactory::new();
        let (runtime, handle) = Runtime::new(
            config,
            org(),
            metadata(),
            platform.clone(),
            factory.clone(),
        );
        let task = tokio::spawn(runtime.run());
        for component in components {
            handle.register(component).await.expect("register component");
        }

        let mut session = factory.take_session().await;
        assert_eq!(session.next_command().await, SessionCommand::Connect);
        let mut harness = Self {
            handle,
            platform,
            factory,
            session,
            subscriptions: Vec::new(),
            task,
        };
        harness.subscriptions = harness.connect().await;
        harness
    }

    /// Report the broker connected and drain the resulting subscriptions.
    pub async fn connect(&mut self) -> Vec<String> {
        self.session.emit(SessionEvent::Connected);
        let mut destinations = Vec::new();
        while let Some(command) = self.session.try_next_command(Duration::from_millis(200)).await {
            match command {
                SessionCommand::Subscribe { destination } => destinations.push(destination),
                other => panic!("unexpected command while subscribing: {other:?}"),
            }
        }
        destinations
    }

    pub fn deliver(&self, frame: Frame) {
        self.session.emit(SessionEvent::Message(frame));
    }

    pub async fn expect_send(&mut self) -> OutboundReply {
        match self.session.next_command().await {
            SessionCommand::Send(reply) => reply,
            other => panic!("expected SEND, got {other:?}"),
        }
    }

    pub async fn expect_ack(&mut self) -> OutboundAck {
        match self.session.next_command().await {
            SessionCommand::Ack(ack) => ack,
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    pub async fn expect_quiet(&mut self, wait: Duration) {
        if let Some(command) = self.session.try_next_command(wait).await {
            panic!("unexpected command {command:?}");
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        self.session.emit(SessionEvent::Stopped);
        let result = tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("runtime stops")
            .expect("runtime task");
        assert!(result.is_ok());
    }
}
