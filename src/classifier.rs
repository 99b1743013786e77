//! Message classifier: turns a delivered frame into a typed event.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::event::{
    decode_payload, normalize_action_name, ActionEvent, DecodeError, Destination, DestinationKind,
    Envelope, FunctionEvent, InboundEvent, LowCodeEvent, ReplyTarget, TypedEvent, UNNAMED_ACTION,
};
use crate::guard::DeliveryGuard;
use crate::rest::PlatformMetadata;
use crate::stomp::frame::{HDR_DESTINATION, HDR_SUBSCRIPTION};
use crate::stomp::{Frame, OutboundAck, OutboundReply};

/// Subscription ids of the form `stomp-<queue>`.
const LEGACY_SUBSCRIPTION_PREFIX: &str = "stomp-";

/// What to do with a delivered frame.
#[derive(Debug)]
pub enum Classification {
    /// No message-id: ack and drop.
    Reject(OutboundAck),
    /// Redelivery of a message the guard still holds.
    Replay {
        reply: Option<OutboundReply>,
        ack: OutboundAck,
    },
    /// Payload could not be decoded. `ack` is set when failures are ignored.
    Undecodable {
        error: DecodeError,
        ack: Option<OutboundAck>,
    },
    /// The action id is not in the cache; refresh and classify again.
    UnknownAction { frame: Frame, action_id: i64 },
    Event(TypedEvent),
}

fn ack_for(frame: &Frame) -> OutboundAck {
    OutboundAck::new(frame.message_id().unwrap_or_default(), frame.clone())
}

fn trim_destination(raw: &str) -> &str {
    raw.strip_prefix("/queue/")
        .or_else(|| raw.strip_prefix('/'))
        .unwrap_or(raw)
}

/// Queue name from the subscription header, falling back to the destination.
pub fn queue_name(frame: &Frame) -> String {
    if let Some(subscription) = frame.header(HDR_SUBSCRIPTION) {
        if let Some(destination) = Destination::parse(subscription) {
            return destination.queue;
        }
        if let Some(queue) = subscription.strip_prefix(LEGACY_SUBSCRIPTION_PREFIX) {
            return queue.to_string();
        }
    }
    let destination = frame.header(HDR_DESTINATION).unwrap_or_default();
    match Destination::parse(destination) {
        Some(parsed) => parsed.queue,
        None => trim_destination(destination).to_string(),
    }
}

fn subscription(frame: &Frame) -> Option<&str> {
    frame
        .header(HDR_SUBSCRIPTION)
        .or_else(|| frame.header(HDR_DESTINATION))
        .map(trim_destination)
}

fn optional(payload: &Value, key: &str) -> Option<Value> {
    payload.get(key).filter(|v| !v.is_null()).cloned()
}

/// Replay what the guard holds for a redelivered message. The stored reply
/// body goes to the new frame's reply coordinates.
fn replay(frame: &Frame, guard: &mut DeliveryGuard, message_id: &str) -> Option<Classification> {
    let held = guard.take_replay(message_id)?;
    info!(
        message_id = %message_id,
        reply = held.reply.is_some(),
        ack = held.had_ack,
        "Skipping reprocess of message, replaying saved delivery"
    );
    let target = ReplyTarget::from_frame(frame);
    let reply = held.reply.map(|mut reply| {
        if let Some(reply_to) = target.reply_to {
            reply.destination = reply_to;
        }
        if target.correlation_id.is_some() {
            reply.correlation_id = target.correlation_id;
        }
        reply
    });
    Some(Classification::Replay {
        reply,
        ack: ack_for(frame),
    })
}

/// Classify a delivered frame.
pub fn classify(
    frame: Frame,
    guard: &mut DeliveryGuard,
    metadata: &PlatformMetadata,
    ignore_message_failure: bool,
) -> Classification {
    let Some(message_id) = frame.message_id().map(str::to_string) else {
        error!(headers = ?frame.headers, "Received message with no message id");
        return Classification::Reject(OutboundAck::new("", frame));
    };

    if let Some(replayed) = replay(&frame, guard, &message_id) {
        return replayed;
    }

    let payload = match decode_payload(&frame.body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(message_id = %message_id, error = %e, data = %DecodeError::raw_base64(&frame.body), "Failed to decode message");
            let ack = if ignore_message_failure {
                warn!(message_id = %message_id, "This message failure will be ignored");
                Some(ack_for(&frame))
            } else {
                None
            };
            return Classification::Undecodable { error: e, ack };
        }
    };

    if let Some(function) = payload.get("function").filter(|f| f.is_object()) {
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let event = FunctionEvent {
            name,
            action_id: function.get("id").and_then(Value::as_i64),
            inputs: payload.get("inputs").cloned().unwrap_or(Value::Null),
            workflow_instance: optional(&payload, "workflow_instance"),
            envelope: Envelope::new(frame, payload),
        };
        debug!(message_id = %message_id, function = %event.name, "Function message");
        return Classification::Event(TypedEvent::Function(event));
    }

    let subscribed = subscription(&frame).map(str::to_string);
    if let Some(destination) = subscribed.as_deref().and_then(Destination::parse) {
        if destination.kind == DestinationKind::Inbound {
            return Classification::Event(TypedEvent::Inbound(InboundEvent {
                queue: destination.queue,
                envelope: Envelope::new(frame, payload),
            }));
        }
    }

    if let Some(destination) = subscribed
        .filter(|s| metadata.low_code_destinations.iter().any(|d| trim_destination(d) == s))
    {
        return Classification::Event(TypedEvent::LowCode(LowCodeEvent {
            destination,
            request_originator: optional(&payload, "request_originator"),
            request_payload: optional(&payload, "request_payload"),
            response_ack: payload
                .get("response_ack")
                .and_then(Value::as_str)
                .map(str::to_string),
            envelope: Envelope::new(frame, payload),
        }));
    }

    let action_id = payload.get("action_id").and_then(Value::as_i64);
    let name = match action_id {
        None => {
            info!(message_id = %message_id, action = UNNAMED_ACTION, "Unnamed action");
            UNNAMED_ACTION.to_string()
        }
        Some(id) => match metadata.action_names.get(&id) {
            Some(display) => normalize_action_name(display),
            None => {
                warn!(message_id = %message_id, action_id = id, "Action is unknown");
                return Classification::UnknownAction {
                    frame,
                    action_id: id,
                };
            }
        },
    };
    let event = ActionEvent {
        queue: queue_name(&frame),
        name,
        action_id,
        principal: optional(&payload, "principal"),
        workflow: optional(&payload, "workflow"),
        envelope: Envelope::new(frame, payload),
    };
    info!(event = %event.name, channel = %format!("actions.{}", event.queue), "Action message");
    Classification::Event(TypedEvent::Action(event))
}
