//! Handler contract and component registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::event::{ChannelKey, TypedEvent};
use crate::registry::{FieldRequirement, FieldTarget};

/// One value produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Yield {
    /// Interim status text.
    Status(String),
    /// Final result.
    Result(Value),
    /// Fails the invocation.
    Error(String),
    /// Anything else; promoted to a status or, for functions, the result.
    Other(Value),
}

impl From<&str> for Yield {
    fn from(text: &str) -> Self {
        Yield::Status(text.to_string())
    }
}

impl From<String> for Yield {
    fn from(text: String) -> Self {
        Yield::Status(text)
    }
}

pub type YieldStream = Box<dyn Iterator<Item = Yield> + Send>;

/// What a handler returns.
pub enum Handled {
    /// Values consumed lazily on the worker thread.
    Stream(YieldStream),
    /// Re-queue the event, after `delay` or a random 0.5 to 1.5 s.
    Defer(Option<Duration>),
}

impl Handled {
    /// Nothing to report.
    pub fn done() -> Self {
        Handled::Stream(Box::new(std::iter::empty()))
    }

    pub fn stream<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Yield>,
        I::IntoIter: Send + 'static,
    {
        Handled::Stream(Box::new(values.into_iter()))
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::stream([Yield::Status(text.into())])
    }

    pub fn result(value: Value) -> Self {
        Self::stream([Yield::Result(value)])
    }
}

impl fmt::Debug for Handled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handled::Stream(_) => f.write_str("Handled::Stream(..)"),
            Handled::Defer(delay) => write!(f, "Handled::Defer({delay:?})"),
        }
    }
}

/// Failure raised by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: <{message}>")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Wrap any error, naming it by its type.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name
            .split('<')
            .next()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or(type_name);
        Self::new(kind, err.to_string())
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Capture a backtrace at the call site (honours `RUST_BACKTRACE`).
    pub fn with_backtrace(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => self.with_trace(backtrace.to_string()),
            _ => self,
        }
    }

    /// Text for a failure reply.
    pub fn reply_text(&self, include_trace: bool) -> String {
        match (&self.trace, include_trace) {
            (Some(trace), true) => format!("{self}\n{trace}"),
            _ => self.to_string(),
        }
    }
}

/// One run of the handlers bound to an event's channel.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub event: Arc<TypedEvent>,
    /// Set on the second visit after a deferral.
    pub deferred: bool,
    sections: Arc<HashMap<String, HashMap<String, String>>>,
}

impl Invocation {
    pub fn new(
        event: Arc<TypedEvent>,
        deferred: bool,
        sections: Arc<HashMap<String, HashMap<String, String>>>,
    ) -> Self {
        Self {
            event,
            deferred,
            sections,
        }
    }

    pub fn event(&self) -> &TypedEvent {
        &self.event
    }

    /// Options from an app section of the configuration file.
    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }

    pub fn defer(&self) -> HandlerResult {
        Ok(Handled::Defer(None))
    }
}

pub type HandlerResult = Result<Handled, HandlerError>;

pub trait Handler: Send + Sync {
    fn handle(&self, invocation: &Invocation) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Invocation) -> HandlerResult + Send + Sync,
{
    fn handle(&self, invocation: &Invocation) -> HandlerResult {
        self(invocation)
    }
}

pub type KeyFn = Arc<dyn Fn(&TypedEvent) -> Option<String> + Send + Sync>;

/// Coalesce events per key within a time window.
#[derive(Clone)]
pub struct Debounce {
    pub window: Duration,
    /// Complete earlier pending events without running the handler.
    pub discard: bool,
    key: Option<KeyFn>,
}

impl fmt::Debug for Debounce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debounce")
            .field("window", &self.window)
            .field("discard", &self.discard)
            .field("custom_key", &self.key.is_some())
            .finish()
    }
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            discard: false,
            key: None,
        }
    }

    pub fn discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&TypedEvent) -> Option<String> + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    /// `<handler> for <incident id>` unless a custom key is set. Events
    /// without a key are not debounced.
    pub fn key_for(&self, handler_name: &str, event: &TypedEvent) -> Option<String> {
        match &self.key {
            Some(key) => key(event),
            None => event
                .incident_id()
                .map(|incident| format!("{handler_name} for {incident}")),
        }
    }
}

/// A handler bound to a channel.
#[derive(Clone)]
pub struct Binding {
    pub channel: ChannelKey,
    pub handler: Arc<dyn Handler>,
    pub debounce: Option<Debounce>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("channel", &self.channel)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

/// A named group of bindings registered and unregistered together.
#[derive(Debug, Clone)]
pub struct Component {
    name: String,
    bindings: Vec<Binding>,
    requirements: Vec<FieldRequirement>,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn on(mut self, channel: ChannelKey, handler: impl Handler + 'static) -> Self {
        self.bindings.push(Binding {
            channel,
            handler: Arc::new(handler),
            debounce: None,
        });
        self
    }

    pub fn on_debounced(
        mut self,
        channel: ChannelKey,
        debounce: Debounce,
        handler: impl Handler + 'static,
    ) -> Self {
        self.bindings.push(Binding {
            channel,
            handler: Arc::new(handler),
            debounce: Some(debounce),
        });
        self
    }

    pub fn requires_incident_field(mut self, name: &str, input_type: Option<&str>) -> Self {
        self.requirements
            .push(FieldRequirement::new(FieldTarget::Incident, name, input_type));
        self
    }

    pub fn requires_action_field(mut self, name: &str, input_type: Option<&str>) -> Self {
        self.requirements.push(FieldRequirement::new(
            FieldTarget::ActionInvocation,
            name,
            input_type,
        ));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.bindings.iter().map(|b| &b.channel)
    }

    pub fn requirements(&self) -> &[FieldRequirement] {
        &self.requirements
    }
}
