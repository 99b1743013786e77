//! STOMP 1.2 frames and the length-aware codec used on the broker socket.
//!
//! Frames are `COMMAND\n(header:value\n)*\nbody\0`. Header values are
//! escaped (`\\`, `\n`, `\r`, `\c`) on every frame except CONNECT and
//! CONNECTED. A bare EOL between frames is a heartbeat.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::StompError;

/// Upper bound on a single buffered frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const HDR_MESSAGE_ID: &str = "message-id";
pub const HDR_SUBSCRIPTION: &str = "subscription";
pub const HDR_DESTINATION: &str = "destination";
pub const HDR_REPLY_TO: &str = "reply-to";
pub const HDR_CORRELATION_ID: &str = "correlation-id";
pub const HDR_ACK: &str = "ack";
pub const HDR_ID: &str = "id";
pub const HDR_TIMESTAMP: &str = "timestamp";
pub const HDR_CONTEXT_TOKEN: &str = "Co3ContextToken";
pub const HDR_CONTENT_LENGTH: &str = "content-length";
pub const HDR_MESSAGE: &str = "message";
pub const HDR_RECEIPT: &str = "receipt";
pub const HDR_HEART_BEAT: &str = "heart-beat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::Protocol(format!("unknown command {other:?}"))),
        })
    }
}

/// A single STOMP frame.
///
/// Headers keep their wire order. Repeated headers are retained but only the
/// first occurrence is visible through [`Frame::header`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(HDR_MESSAGE_ID)
    }

    /// Identifier an ACK frame must carry for this message.
    ///
    /// STOMP 1.2 brokers send an `ack` header; older brokers only a `message-id`.
    pub fn ack_id(&self) -> Option<&str> {
        self.header(HDR_ACK).or_else(|| self.message_id())
    }
}

/// Item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Frame(Frame),
    Heartbeat,
}

/// Item accepted by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Frame),
    Heartbeat,
}

impl From<Frame> for Outgoing {
    fn from(frame: Frame) -> Self {
        Outgoing::Frame(frame)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StompCodec;

fn escape(value: &str, out: &mut BytesMut) {
    for c in value.chars() {
        match c {
            '\\' => out.put_slice(b"\\\\"),
            '\n' => out.put_slice(b"\\n"),
            '\r' => out.put_slice(b"\\r"),
            ':' => out.put_slice(b"\\c"),
            c => {
                let mut buf = [0u8; 4];
                out.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Locate the blank line ending the header block.
///
/// Returns `(end of headers, start of body)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), StompError> {
    let head = std::str::from_utf8(head)
        .map_err(|e| StompError::Protocol(format!("frame header is not UTF-8: {e}")))?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command: Command = lines.next().unwrap_or_default().parse()?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::Protocol(format!("malformed header line {line:?}")))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Incoming;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>, StompError> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(Incoming::Heartbeat));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] == b'\n' {
                    src.advance(2);
                    return Ok(Some(Incoming::Heartbeat));
                }
            }
            Some(_) => {}
        }

        let Some((head_end, body_start)) = find_header_end(src) else {
            if src.len() > MAX_FRAME_SIZE {
                return Err(StompError::FrameTooLarge(src.len()));
            }
            return Ok(None);
        };

        let (command, headers) = parse_head(&src[..head_end])?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k == HDR_CONTENT_LENGTH)
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| StompError::Protocol(format!("invalid content-length {v:?}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                if len > MAX_FRAME_SIZE {
                    return Err(StompError::FrameTooLarge(len));
                }
                if src.len() < body_start + len + 1 {
                    src.reserve(body_start + len + 1 - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(StompError::Protocol(
                        "frame body not terminated by NUL".to_string(),
                    ));
                }
                body_start + len
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(pos) => body_start + pos,
                None => {
                    if src.len() > MAX_FRAME_SIZE {
                        return Err(StompError::FrameTooLarge(src.len()));
                    }
                    return Ok(None);
                }
            },
        };

        let mut raw = src.split_to(body_end + 1);
        raw.advance(body_start);
        raw.truncate(body_end - body_start);

        Ok(Some(Incoming::Frame(Frame {
            command,
            headers,
            body: raw.freeze(),
        })))
    }
}

impl Encoder<Outgoing> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), StompError> {
        let frame = match item {
            Outgoing::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            Outgoing::Frame(frame) => frame,
        };

        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        let escaped = frame.command.escapes_headers();
        for (name, value) in &frame.headers {
            if name == HDR_CONTENT_LENGTH {
                continue;
            }
            if escaped {
                escape(name, dst);
                dst.put_u8(b':');
                escape(value, dst);
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() {
            dst.put_slice(format!("{HDR_CONTENT_LENGTH}:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
