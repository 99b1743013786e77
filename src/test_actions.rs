//! Test-action server: inject synthetic action messages over TCP.
//!
//! Requests are length-prefixed (4-byte big-endian) and carry a 4-byte
//! big-endian id followed by `<queue> <message json>`. Every response line is
//! length-prefixed the same way and tagged `<action N>`. Test invocations
//! are never acked and never replied to on the broker.

use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::dispatch::StatusReply;
use crate::runtime::RuntimeHandle;
use crate::stomp::{Command, Frame};

const USAGE: &str = "Submit actions with format: <queue> <message json>";

/// A test invocation handed to the runtime.
#[derive(Debug)]
pub struct TestSubmission {
    pub queue: String,
    pub payload: Value,
    pub responses: mpsc::UnboundedSender<TestResponse>,
}

/// Progress of a test invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TestResponse {
    Status(StatusReply),
    Completed(StatusReply),
    Failed(String),
}

/// Headers a real action message would carry.
pub fn synthetic_frame(org_id: i64, queue: &str, test_id: u64, payload: &Value) -> Frame {
    let timestamp = chrono::Utc::now().timestamp_millis();
    Frame::new(Command::Message)
        .with_header("reply-to", format!("/queue/acks.{org_id}.{queue}"))
        .with_header("expires", "0")
        .with_header("timestamp", timestamp.to_string())
        .with_header("destination", format!("/queue/actions.{org_id}.{queue}"))
        .with_header("correlation-id", format!("invid:{test_id}"))
        .with_header("persistent", "True")
        .with_header("priority", "4")
        .with_header("Co3MessagePayload", "ActionDataDTO")
        .with_header("Co3ContentType", "application/json")
        .with_header("message-id", format!("ID:resilient-54199-{test_id}-6:2:12:1:1"))
        .with_header("Co3ContextToken", "dummy")
        .with_header("subscription", format!("stomp-{queue}"))
        .with_body(payload.to_string().into_bytes())
}

/// Parsed request, or the error line to send back.
fn parse_request(mut data: Bytes) -> (u32, std::result::Result<(String, Value), String>) {
    if data.len() < 4 {
        return (0, Err(format!("<action 0>: {USAGE}")));
    }
    let msg_id = data.get_u32();
    let text = String::from_utf8_lossy(&data);
    let text = text.trim();
    let Some((queue, message)) = text.split_once(' ') else {
        return (msg_id, Err(format!("<action {msg_id}>: {USAGE}")));
    };
    match serde_json::from_str::<Value>(message) {
        Ok(payload) if payload.is_object() => (msg_id, Ok((queue.to_string(), payload))),
        Ok(_) => (
            msg_id,
            Err(format!("Bad Message<action {msg_id}>! message is not an object")),
        ),
        Err(e) => (msg_id, Err(format!("Bad Message<action {msg_id}>! {e}"))),
    }
}

fn format_response(msg_id: u32, response: &TestResponse) -> Vec<String> {
    match response {
        TestResponse::Status(reply) => vec![format!("RESPONSE<action {msg_id}>: {}", reply.body())],
        TestResponse::Completed(reply) => {
            let summary = if reply.is_failure() {
                format!("Action Failed<action {msg_id}>: {}", reply.message)
            } else {
                format!("Action Completed<action {msg_id}>: {}\n", reply.message)
            };
            vec![format!("RESPONSE<action {msg_id}>: {}", reply.body()), summary]
        }
        TestResponse::Failed(reason) => vec![format!("Action Failed<action {msg_id}>: {reason}")],
    }
}

pub struct TestActionServer {
    listener: TcpListener,
    runtime: RuntimeHandle,
}

impl TestActionServer {
    pub async fn bind(host: &str, port: u16, runtime: RuntimeHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!(address = %listener.local_addr()?, "Test action server listening");
        Ok(Self { listener, runtime })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Test client connected");
                    tokio::spawn(serve_client(stream, self.runtime.clone()));
                }
                Err(e) => {
                    error!(error = %e, "Test action server accept failed");
                    return;
                }
            }
        }
    }
}

async fn serve_client(stream: TcpStream, runtime: RuntimeHandle) {
    let (mut sink, mut source) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = lines_rx.recv().await {
            if let Err(e) = sink.send(Bytes::from(line.into_bytes())).await {
                warn!(error = %e, "Test client write failed");
                return;
            }
        }
    });

    while let Some(item) = source.next().await {
        let data: BytesMut = match item {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Test client read failed");
                break;
            }
        };
        let (msg_id, request) = parse_request(data.freeze());
        let (queue, payload) = match request {
            Ok(parsed) => parsed,
            Err(line) => {
                let _ = lines_tx.send(line);
                continue;
            }
        };

        let (responses, mut rx) = mpsc::unbounded_channel();
        let submitted = runtime.submit_test(TestSubmission {
            queue,
            payload,
            responses,
        });
        if !submitted {
            let _ = lines_tx.send(format!("Action Failed<action {msg_id}>: runtime stopped"));
            continue;
        }
        let _ = lines_tx.send(format!("Action Submitted<action {msg_id}>"));

        let lines = lines_tx.clone();
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let done = !matches!(response, TestResponse::Status(_));
                for line in format_response(msg_id, &response) {
                    let _ = lines.send(line);
                }
                if done {
                    break;
                }
            }
        });
    }

    drop(lines_tx);
    let _ = writer.await;
}
