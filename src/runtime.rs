//! Runtime: the single event loop tying session, registry, classifier,
//! dispatcher and delivery guard together.
//!
//! Everything the loop owns is mutated only here. Handlers, the broker
//! session and REST calls run elsewhere and talk to the loop through
//! channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, Classification};
use crate::config::{Config, ConfigError};
use crate::dispatch::{Component, Delivery, DispatchEvent, Dispatcher, StatusReply};
use crate::event::TypedEvent;
use crate::guard::{DeliveryGuard, Retry};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::rest::{self, MetadataCache, OrgContext, PlatformApi, PlatformMetadata, RestError};
use crate::stomp::{
    FatalError, Frame, OutboundAck, SessionCommand, SessionEnvelope, SessionEvent,
    SessionFactory, SessionHandle, StompError,
};
use crate::test_actions::{self, TestResponse, TestSubmission};

/// How often REST inactivity is checked.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// How long shutdown waits for the session to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const NO_SESSION: &str = "no broker session";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Broker session failed: {0}")]
    Fatal(FatalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Stomp(#[from] StompError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Runtime is not running")]
    Stopped,
}

impl RuntimeError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Fatal(fatal) => fatal.exit_code(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

enum CoreCommand {
    Register {
        component: Component,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister(String),
    Reload {
        config: Box<Config>,
        api: Arc<dyn PlatformApi>,
        reply: oneshot::Sender<Result<()>>,
    },
    SubmitTest(TestSubmission),
    Shutdown,
}

enum Internal {
    ActionsRefreshed {
        frame: Frame,
        result: rest::Result<HashMap<i64, String>>,
    },
}

/// Cloneable control surface of a running [`Runtime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::UnboundedSender<CoreCommand>,
    metadata: MetadataCache,
}

impl RuntimeHandle {
    /// Bind a component's handlers and subscribe their destinations.
    pub async fn register(&self, component: Component) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CoreCommand::Register { component, reply })
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub fn unregister(&self, name: &str) {
        let _ = self.commands.send(CoreCommand::Unregister(name.to_string()));
    }

    /// Swap in new configuration: new session, refreshed metadata, resubscribe.
    pub async fn reload(&self, config: Config, api: Arc<dyn PlatformApi>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CoreCommand::Reload {
                config: Box::new(config),
                api,
                reply,
            })
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub fn submit_test(&self, submission: TestSubmission) -> bool {
        self.commands
            .send(CoreCommand::SubmitTest(submission))
            .is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(CoreCommand::Shutdown);
    }

    /// Platform definitions, refreshed on reload.
    pub fn metadata(&self) -> Arc<PlatformMetadata> {
        self.metadata.get()
    }
}

pub struct Runtime {
    config: Config,
    org: OrgContext,
    api: Arc<dyn PlatformApi>,
    factory: Arc<dyn SessionFactory>,
    metadata: MetadataCache,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    guard: DeliveryGuard,
    session: Option<SessionHandle>,
    generation: u64,
    tests: HashMap<u64, mpsc::UnboundedSender<TestResponse>>,
    next_test_id: u64,
    commands: mpsc::UnboundedReceiver<CoreCommand>,
    session_tx: mpsc::UnboundedSender<SessionEnvelope>,
    session_rx: mpsc::UnboundedReceiver<SessionEnvelope>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Runtime {
    pub fn new(
        config: Config,
        org: OrgContext,
        metadata: PlatformMetadata,
        api: Arc<dyn PlatformApi>,
        factory: Arc<dyn SessionFactory>,
    ) -> (Self, RuntimeHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let options = &config.options;
        let mut dispatcher =
            Dispatcher::new(options.num_workers, options.include_stack_trace, dispatch_tx);
        dispatcher.set_sections(config.sections.clone());
        let guard = DeliveryGuard::new(options.stomp_max_retries);
        let registry = SubscriptionRegistry::new(org.org_id);
        let metadata = MetadataCache::new(metadata);

        let handle = RuntimeHandle {
            commands: commands_tx,
            metadata: metadata.clone(),
        };
        let runtime = Self {
            config,
            org,
            api,
            factory,
            metadata,
            registry,
            dispatcher,
            guard,
            session: None,
            generation: 0,
            tests: HashMap::new(),
            next_test_id: 0,
            commands,
            session_tx,
            session_rx,
            dispatch_rx,
            internal_tx,
            internal_rx,
        };
        (runtime, handle)
    }

    /// Run until shutdown or a fatal session error.
    pub async fn run(mut self) -> Result<()> {
        self.start_session()?;

        let period = self.config.options.retry_interval();
        let mut retry_tick = interval_at(Instant::now() + period, period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_tick = interval_at(Instant::now() + IDLE_CHECK_INTERVAL, IDLE_CHECK_INTERVAL);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(CoreCommand::Shutdown) | None => {
                        self.shutdown().await;
                        return Ok(());
                    }
                    Some(command) => self.on_command(command).await,
                },
                Some(envelope) = self.session_rx.recv() => self.on_session_event(envelope)?,
                Some(event) = self.dispatch_rx.recv() => self.on_dispatch_event(event),
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                _ = retry_tick.tick() => self.retry_failed_deliveries(),
                _ = idle_tick.tick() => self.check_idle(),
            }
        }
    }

    fn start_session(&mut self) -> Result<()> {
        if !self.org.actions_enabled {
            warn!(
                org = %self.org.org_name,
                "Actions framework is not enabled for this organization; not connecting to the broker"
            );
            return Ok(());
        }
        self.generation += 1;
        let config = self.config.options.session_config()?;
        info!(
            host = %config.host,
            port = config.port,
            generation = self.generation,
            "Starting STOMP session"
        );
        let session = self
            .factory
            .spawn(config, self.generation, self.session_tx.clone())?;
        session.send(SessionCommand::Connect);
        self.session = Some(session);
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Shutting down");
        let Some(session) = self.session.take() else {
            return;
        };
        let generation = session.generation;
        session.send(SessionCommand::Shutdown);
        let session_rx = &mut self.session_rx;
        let stopped = async {
            while let Some(envelope) = session_rx.recv().await {
                if envelope.generation == generation && envelope.event == SessionEvent::Stopped {
                    return;
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, stopped).await.is_err() {
            warn!("STOMP session did not stop in time");
        }
    }

    /// Hand a command to the current session. Undeliverable acks and final
    /// replies go to the guard.
    fn send(&mut self, command: SessionCommand) {
        if let Some(session) = &self.session {
            if session.send(command.clone()) {
                return;
            }
        }
        match command {
            SessionCommand::Send(reply) => self.guard.reply_failed(reply, NO_SESSION),
            SessionCommand::Ack(ack) => self.guard.ack_failed(ack, NO_SESSION),
            other => debug!(command = ?other, "No broker session, dropping command"),
        }
    }

    fn send_all(&mut self, commands: Vec<SessionCommand>) {
        for command in commands {
            self.send(command);
        }
    }

    async fn on_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Register { component, reply } => {
                let _ = reply.send(self.register(component));
            }
            CoreCommand::Unregister(name) => {
                self.dispatcher.remove_component(&name);
                let commands = self.registry.unregister(&name);
                self.send_all(commands);
                info!(component = %name, "Component unregistered");
            }
            CoreCommand::Reload { config, api, reply } => {
                let result = self.reload(*config, api).await;
                if let Err(e) = &result {
                    error!(error = %e, "Reload failed");
                }
                let _ = reply.send(result);
            }
            CoreCommand::SubmitTest(submission) => self.submit_test(submission),
            CoreCommand::Shutdown => {}
        }
    }

    fn register(&mut self, component: Component) -> Result<()> {
        let metadata = self.metadata.get();
        let commands = self.registry.register(&component, &metadata)?;
        self.dispatcher.add_component(&component);
        self.send_all(commands);
        info!(
            component = %component.name(),
            bindings = component.bindings().len(),
            "Component registered"
        );
        Ok(())
    }

    async fn reload(&mut self, config: Config, api: Arc<dyn PlatformApi>) -> Result<()> {
        info!("Reloading configuration");
        config.options.validate()?;
        api.reset();
        let org = api.connect().await?;
        let metadata = rest::load_metadata(api.as_ref(), &org).await?;
        self.registry.rebuild(org.org_id, &metadata)?;

        if let Some(session) = self.session.take() {
            session.send(SessionCommand::Shutdown);
        }
        self.metadata.replace(metadata);
        self.dispatcher.set_sections(config.sections.clone());
        self.api = api;
        self.org = org;
        self.config = config;
        self.start_session()
    }

    fn on_session_event(&mut self, envelope: SessionEnvelope) -> Result<()> {
        let current = envelope.generation == self.generation;
        match envelope.event {
            SessionEvent::SendOutcome { reply, result } => match result {
                Ok(()) => {
                    self.guard.reply_delivered(&reply.message_id);
                }
                Err(reason) => self.guard.reply_failed(reply, &reason),
            },
            SessionEvent::AckOutcome { ack, result } => match result {
                Ok(()) => {
                    self.guard.ack_delivered(&ack.message_id);
                }
                Err(reason) => self.guard.ack_failed(ack, &reason),
            },
            event if !current => {
                debug!(generation = envelope.generation, event = ?event, "Ignoring event from previous session");
            }
            SessionEvent::Connected => {
                info!("STOMP connected");
                self.guard.mark_previous_session();
                let commands = self.registry.resubscribe_all();
                self.send_all(commands);
            }
            SessionEvent::Disconnected { reconnect } => {
                info!(reconnect, "STOMP disconnected");
                self.registry.on_disconnected();
            }
            SessionEvent::ConnectionFailed { reason } => {
                warn!(reason = %reason, "STOMP connection attempt failed");
            }
            SessionEvent::HeartbeatTimeout => {
                error!("Reconnecting after STOMP heartbeat timeout");
            }
            SessionEvent::BrokerError { message } => {
                error!(message = %message, "STOMP error");
            }
            SessionEvent::Message(frame) => self.on_frame(frame, false),
            SessionEvent::Fatal(fatal) => {
                error!(error = %fatal, "STOMP session failed");
                self.session = None;
                return Err(RuntimeError::Fatal(fatal));
            }
            SessionEvent::Stopped => {
                info!("STOMP session stopped");
                self.session = None;
                self.registry.on_disconnected();
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, refreshed: bool) {
        let metadata = self.metadata.get();
        let ignore = self.config.options.ignore_message_failure;
        match classify(frame, &mut self.guard, &metadata, ignore) {
            Classification::Reject(ack) => self.send(SessionCommand::Ack(ack)),
            Classification::Replay { reply, ack } => {
                if let Some(reply) = reply {
                    self.send(SessionCommand::Send(reply));
                }
                self.send(SessionCommand::Ack(ack));
            }
            Classification::Undecodable { ack, .. } => {
                if let Some(ack) = ack {
                    self.send(SessionCommand::Ack(ack));
                }
            }
            Classification::UnknownAction { frame, action_id } if refreshed => {
                error!(
                    action_id,
                    message_id = ?frame.message_id(),
                    "Action is not defined, leaving message unacknowledged"
                );
            }
            Classification::UnknownAction { frame, .. } => self.refresh_actions(frame),
            Classification::Event(event) => {
                info!(event = %event, channel = %event.channel(), "Dispatching");
                let delivery = Delivery::new(Arc::new(event));
                if !self.dispatcher.dispatch(delivery.clone()) {
                    let channel = delivery.event.channel();
                    self.finish(delivery, StatusReply::failure(format!("No handler for {channel}")));
                }
            }
        }
    }

    fn refresh_actions(&self, frame: Frame) {
        let api = self.api.clone();
        let org_id = self.org.org_id;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = rest::fetch_action_names(api.as_ref(), org_id).await;
            post_internal(&internal, Internal::ActionsRefreshed { frame, result });
        });
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ActionsRefreshed { frame, result } => match result {
                Ok(names) => {
                    self.metadata.set_action_names(names);
                    self.on_frame(frame, true);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        message_id = ?frame.message_id(),
                        "Failed to refresh action definitions, leaving message unacknowledged"
                    );
                }
            },
        }
    }

    fn on_dispatch_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Interim { delivery, reply } => {
                if let Some(test_id) = delivery.test_id {
                    if let Some(responses) = self.tests.get(&test_id) {
                        let _ = responses.send(TestResponse::Status(reply));
                    }
                    return;
                }
                if !delivery.event.expects_reply() {
                    return;
                }
                if let Some(outbound) = reply.to_outbound(delivery.event.reply_target()) {
                    self.send(SessionCommand::Send(outbound));
                }
            }
            DispatchEvent::Finished { delivery, reply } => self.finish(delivery, reply),
            DispatchEvent::DebounceElapsed { key, generation } => {
                self.dispatcher.on_debounce_elapsed(&key, generation);
            }
        }
    }

    /// Final reply, then the ack.
    fn finish(&mut self, delivery: Delivery, reply: StatusReply) {
        if let Some(test_id) = delivery.test_id {
            if let Some(responses) = self.tests.remove(&test_id) {
                let _ = responses.send(TestResponse::Completed(reply));
            }
            return;
        }

        let event = delivery.event;
        if event.expects_reply() {
            match reply.to_outbound(event.reply_target()) {
                Some(outbound) => self.send(SessionCommand::Send(outbound)),
                None => warn!(event = %event, "Message has no reply-to, final reply not sent"),
            }
        }
        if let TypedEvent::LowCode(low_code) = event.as_ref() {
            if let Some(url) = &low_code.response_ack {
                self.post_low_code_response(url.clone(), &reply);
            }
        }

        let frame = event.envelope().frame.clone();
        let ack = OutboundAck::new(event.message_id(), frame);
        self.send(SessionCommand::Ack(ack));
        info!(event = %event, failed = reply.is_failure(), "Invocation complete");
    }

    fn post_low_code_response(&self, url: String, reply: &StatusReply) {
        let api = self.api.clone();
        let body = reply.to_value();
        tokio::spawn(async move {
            match api.post(&url, &body).await {
                Ok(_) => debug!(url = %url, "Low-code response acknowledged"),
                Err(e) => error!(url = %url, error = %e, "Failed to post low-code response"),
            }
        });
    }

    fn submit_test(&mut self, submission: TestSubmission) {
        self.next_test_id += 1;
        let test_id = self.next_test_id;
        let frame =
            test_actions::synthetic_frame(self.org.org_id, &submission.queue, test_id, &submission.payload);
        let metadata = self.metadata.get();
        let event = match classify(frame, &mut self.guard, &metadata, false) {
            Classification::Event(event) => event,
            other => {
                let reason = match other {
                    Classification::UnknownAction { action_id, .. } => {
                        format!("Action {action_id} is not defined")
                    }
                    _ => "Message could not be classified".to_string(),
                };
                let _ = submission.responses.send(TestResponse::Failed(reason));
                return;
            }
        };
        let delivery = Delivery::for_test(Arc::new(event), test_id);
        self.tests.insert(test_id, submission.responses);
        info!(test_id, event = %delivery.event, "Test action submitted");
        if !self.dispatcher.dispatch(delivery.clone()) {
            let channel = delivery.event.channel();
            self.finish(delivery, StatusReply::failure(format!("No handler for {channel}")));
        }
    }

    /// Re-issue failed replies and acks of the current session.
    fn retry_failed_deliveries(&mut self) {
        if !self.registry.is_connected() {
            return;
        }
        let due = self.guard.due_retries();
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "Retrying failed deliveries");
        for retry in due {
            match retry {
                Retry::Reply(reply) => self.send(SessionCommand::Send(reply)),
                Retry::Ack(ack) => self.send(SessionCommand::Ack(ack)),
            }
        }
    }

    fn check_idle(&self) {
        let idle = self.api.idle_for();
        if idle >= self.config.options.idle_reset() {
            info!(idle_secs = idle.as_secs(), "Resetting idle REST client");
            self.api.reset();
        }
    }
}

/// Hand a background result back to the event loop. False once it has stopped.
fn post_internal(internal: &mpsc::UnboundedSender<Internal>, message: Internal) -> bool {
    match internal.send(message) {
        Ok(()) => true,
        Err(mpsc::error::SendError(Internal::ActionsRefreshed { frame, .. })) => {
            debug!(
                message_id = ?frame.message_id(),
                "Runtime stopped, dropping refreshed action message"
            );
            false
        }
    }
}
