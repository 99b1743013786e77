//! Status reply bodies sent to the platform.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::ReplyTarget;
use crate::stomp::{OutboundReply, ReplyKind};

pub const MESSAGE_TYPE_SUCCESS: u8 = 0;
pub const MESSAGE_TYPE_FAILURE: u8 = 1;

/// `{message_type, message, complete, results?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub message_type: u8,
    pub message: String,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

impl StatusReply {
    pub fn interim(message: impl Into<String>) -> Self {
        Self {
            message_type: MESSAGE_TYPE_SUCCESS,
            message: message.into(),
            complete: false,
            results: None,
        }
    }

    pub fn success(message: impl Into<String>, results: Option<Value>) -> Self {
        Self {
            message_type: MESSAGE_TYPE_SUCCESS,
            message: message.into(),
            complete: true,
            results,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message_type: MESSAGE_TYPE_FAILURE,
            message: message.into(),
            complete: true,
            results: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.message_type == MESSAGE_TYPE_FAILURE
    }

    pub fn to_value(&self) -> Value {
        let mut body = json!({
            "message_type": self.message_type,
            "message": self.message,
            "complete": self.complete,
        });
        if let (Some(results), Some(map)) = (&self.results, body.as_object_mut()) {
            map.insert("results".to_string(), results.clone());
        }
        body
    }

    pub fn body(&self) -> String {
        self.to_value().to_string()
    }

    /// Wire reply for `target`, or `None` when the message named no `reply-to`.
    pub fn to_outbound(&self, target: &ReplyTarget) -> Option<OutboundReply> {
        Some(OutboundReply {
            message_id: target.message_id.clone(),
            destination: target.reply_to.clone()?,
            correlation_id: target.correlation_id.clone(),
            body: self.body(),
            kind: if self.complete {
                ReplyKind::Final
            } else {
                ReplyKind::Interim
            },
        })
    }
}
