//! Typed events delivered to handlers, and the names that route them.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::stomp::frame::{
    HDR_CONTEXT_TOKEN, HDR_CORRELATION_ID, HDR_DESTINATION, HDR_REPLY_TO, HDR_TIMESTAMP,
};
use crate::stomp::Frame;

/// Action name used when a message carries no action id.
pub const UNNAMED_ACTION: &str = "_unnamed_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    Actions,
    Inbound,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Actions => "actions",
            DestinationKind::Inbound => "inbound",
        }
    }
}

/// A broker destination `<kind>.<org>.<queue>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub kind: DestinationKind,
    pub org_id: i64,
    pub queue: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, org_id: i64, queue: impl Into<String>) -> Self {
        Self {
            kind,
            org_id,
            queue: queue.into(),
        }
    }

    /// Parse `<kind>.<org>.<queue>`, tolerating a leading `/` or `/queue/`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw
            .strip_prefix("/queue/")
            .or_else(|| raw.strip_prefix('/'))
            .unwrap_or(raw);
        let mut parts = trimmed.splitn(3, '.');
        let kind = match parts.next()? {
            "actions" => DestinationKind::Actions,
            "inbound" => DestinationKind::Inbound,
            _ => return None,
        };
        let org_id = parts.next()?.parse().ok()?;
        let queue = parts.next().filter(|q| !q.is_empty())?;
        Some(Self::new(kind, org_id, queue))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind.as_str(), self.org_id, self.queue)
    }
}

/// Routing key binding handlers to events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Actions(String),
    Functions(String),
    Inbound(String),
    LowCode,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Actions(queue) => write!(f, "actions.{queue}"),
            ChannelKey::Functions(name) => write!(f, "functions.{name}"),
            ChannelKey::Inbound(queue) => write!(f, "inbound.{queue}"),
            ChannelKey::LowCode => f.write_str("low_code"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid channel name: {0}")]
pub struct InvalidChannel(pub String);

impl FromStr for ChannelKey {
    type Err = InvalidChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "low_code" {
            return Ok(ChannelKey::LowCode);
        }
        let (prefix, rest) = s
            .split_once('.')
            .filter(|(_, rest)| !rest.is_empty())
            .ok_or_else(|| InvalidChannel(s.to_string()))?;
        match prefix {
            "actions" => Ok(ChannelKey::Actions(rest.to_string())),
            "functions" => Ok(ChannelKey::Functions(rest.to_string())),
            "inbound" => Ok(ChannelKey::Inbound(rest.to_string())),
            _ => Err(InvalidChannel(s.to_string())),
        }
    }
}

/// Lowercase a display name and collapse runs of non-word characters to `_`.
pub fn normalize_action_name(display_name: &str) -> String {
    let mut out = String::with_capacity(display_name.len());
    let mut in_run = false;
    for c in display_name.trim().to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Where replies for an event go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyTarget {
    pub message_id: String,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl ReplyTarget {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            message_id: frame.message_id().unwrap_or_default().to_string(),
            reply_to: frame.header(HDR_REPLY_TO).map(str::to_string),
            correlation_id: frame.header(HDR_CORRELATION_ID).map(str::to_string),
        }
    }
}

/// Fields shared by every typed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub frame: Frame,
    pub payload: Value,
    pub reply: ReplyTarget,
    pub timestamp: Option<DateTime<Utc>>,
    pub context_token: Option<String>,
}

impl Envelope {
    pub fn new(frame: Frame, payload: Value) -> Self {
        let timestamp = frame
            .header(HDR_TIMESTAMP)
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let context_token = frame.header(HDR_CONTEXT_TOKEN).map(str::to_string);
        Self {
            reply: ReplyTarget::from_frame(&frame),
            frame,
            payload,
            timestamp,
            context_token,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.frame.header(name)
    }

    pub fn destination(&self) -> Option<&str> {
        self.frame.header(HDR_DESTINATION)
    }

    pub fn message_id(&self) -> &str {
        &self.reply.message_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub queue: String,
    pub name: String,
    pub action_id: Option<i64>,
    pub principal: Option<Value>,
    pub workflow: Option<Value>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEvent {
    pub name: String,
    pub action_id: Option<i64>,
    pub inputs: Value,
    pub workflow_instance: Option<Value>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub queue: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LowCodeEvent {
    pub destination: String,
    pub request_originator: Option<Value>,
    pub request_payload: Option<Value>,
    pub response_ack: Option<String>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedEvent {
    Action(ActionEvent),
    Function(FunctionEvent),
    Inbound(InboundEvent),
    LowCode(LowCodeEvent),
}

impl TypedEvent {
    pub fn envelope(&self) -> &Envelope {
        match self {
            TypedEvent::Action(e) => &e.envelope,
            TypedEvent::Function(e) => &e.envelope,
            TypedEvent::Inbound(e) => &e.envelope,
            TypedEvent::LowCode(e) => &e.envelope,
        }
    }

    pub fn channel(&self) -> ChannelKey {
        match self {
            TypedEvent::Action(e) => ChannelKey::Actions(e.queue.clone()),
            TypedEvent::Function(e) => ChannelKey::Functions(e.name.clone()),
            TypedEvent::Inbound(e) => ChannelKey::Inbound(e.queue.clone()),
            TypedEvent::LowCode(_) => ChannelKey::LowCode,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.envelope().payload
    }

    pub fn message_id(&self) -> &str {
        self.envelope().message_id()
    }

    pub fn reply_target(&self) -> &ReplyTarget {
        &self.envelope().reply
    }

    /// Inbound messages are fire-and-forget.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, TypedEvent::Inbound(_))
    }

    /// Incident id carried by the payload, used for debouncing.
    pub fn incident_id(&self) -> Option<i64> {
        self.payload()
            .get("incident")
            .and_then(|incident| incident.get("id"))
            .and_then(Value::as_i64)
    }

    pub fn display_name(&self) -> String {
        match self {
            TypedEvent::Action(e) => e.name.clone(),
            TypedEvent::Function(e) => e.name.clone(),
            TypedEvent::Inbound(e) => format!("inbound.{}", e.queue),
            TypedEvent::LowCode(e) => e.destination.clone(),
        }
    }
}

impl fmt::Display for TypedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name(), self.message_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

impl DecodeError {
    /// Base64 of the raw payload, for logging.
    pub fn raw_base64(payload: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(payload)
    }
}

/// Decode a JSON payload.
///
/// Bodies that fail strict UTF-8 because they carry surrogate pairs encoded
/// as separate three-byte sequences are re-decoded with the pairs combined.
pub fn decode_payload(body: &[u8]) -> Result<Value, DecodeError> {
    let text = match std::str::from_utf8(body) {
        Ok(text) => std::borrow::Cow::Borrowed(text),
        Err(_) => std::borrow::Cow::Owned(decode_with_surrogates(body).ok_or(DecodeError::Utf8)?),
    };
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&text).map_err(|e| DecodeError::Json(e.to_string()))
}

/// UTF-8 decoding that accepts encoded UTF-16 surrogates (CESU-8 / WTF-8).
///
/// A high surrogate followed by a low surrogate becomes one scalar value;
/// lone surrogates are rejected.
fn decode_with_surrogates(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let rest = &bytes[i..];
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let good = e.valid_up_to();
                out.push_str(std::str::from_utf8(&rest[..good]).ok()?);
                i += good;
            }
        }
        let high = surrogate_at(bytes, i)?;
        if !(0xD800..0xDC00).contains(&high) {
            return None;
        }
        let low = surrogate_at(bytes, i + 3)?;
        if !(0xDC00..0xE000).contains(&low) {
            return None;
        }
        let scalar = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
        out.push(char::from_u32(scalar)?);
        i += 6;
    }
    Some(out)
}

fn surrogate_at(bytes: &[u8], i: usize) -> Option<u32> {
    let seq = bytes.get(i..i + 3)?;
    if seq[0] != 0xED || seq[1] & 0xC0 != 0x80 || seq[2] & 0xC0 != 0x80 {
        return None;
    }
    let value = ((seq[0] as u32 & 0x0F) << 12) | ((seq[1] as u32 & 0x3F) << 6) | (seq[2] as u32 & 0x3F);
    (0xD800..0xE000).contains(&value).then_some(value)
}
