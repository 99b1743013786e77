//! Folds a handler yield stream into interim statuses and one final reply.

use serde_json::Value;
use tracing::{error, warn};

use super::handler::Yield;
use super::reply::StatusReply;
use crate::event::TypedEvent;

pub const DEFAULT_ACTION_STATUS: &str = "No handler returned a result for this action";
pub const DEFAULT_FUNCTION_STATUS: &str = "Completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldKind {
    /// Statuses only; results are ignored.
    Action,
    /// First result wins.
    Function,
}

impl FoldKind {
    pub fn for_event(event: &TypedEvent) -> Self {
        match event {
            TypedEvent::Function(_) | TypedEvent::LowCode(_) => FoldKind::Function,
            TypedEvent::Action(_) | TypedEvent::Inbound(_) => FoldKind::Action,
        }
    }
}

/// What one yielded value means for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Interim(String),
    Failed(String),
    Quiet,
}

#[derive(Debug)]
pub struct ReplyFold {
    kind: FoldKind,
    statuses: Vec<String>,
    result: Option<Value>,
}

fn status_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl ReplyFold {
    pub fn new(kind: FoldKind) -> Self {
        Self {
            kind,
            statuses: Vec::new(),
            result: None,
        }
    }

    fn take_result(&mut self, value: Value) {
        if !value.is_object() {
            error!(result = %value, "Function result is not an object, sending anyway");
        }
        self.result = Some(value);
    }

    pub fn push(&mut self, value: Yield) -> Step {
        match value {
            Yield::Status(text) => {
                self.statuses.push(text.clone());
                Step::Interim(text)
            }
            Yield::Error(text) => Step::Failed(text),
            Yield::Result(value) => {
                match (self.kind, self.result.is_some()) {
                    (FoldKind::Function, false) => self.take_result(value),
                    (FoldKind::Function, true) => {
                        warn!(result = %value, "Ignoring additional function result")
                    }
                    (FoldKind::Action, _) => {
                        warn!(result = %value, "Ignoring result yielded by action handler")
                    }
                }
                Step::Quiet
            }
            Yield::Other(value) => {
                if self.kind == FoldKind::Function && self.result.is_none() {
                    self.take_result(value);
                    return Step::Quiet;
                }
                let text = status_text(&value);
                self.statuses.push(text.clone());
                Step::Interim(text)
            }
        }
    }

    /// Final success reply.
    pub fn finish(self) -> StatusReply {
        let message = if self.statuses.is_empty() {
            match self.kind {
                FoldKind::Action => DEFAULT_ACTION_STATUS.to_string(),
                FoldKind::Function => DEFAULT_FUNCTION_STATUS.to_string(),
            }
        } else {
            self.statuses.join("\n")
        };
        StatusReply::success(message, self.result)
    }
}
