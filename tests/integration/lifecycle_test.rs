//! Runtime lifecycle: registration, reload, shutdown and the test-action
//! server.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use common::{message, Harness};
use soarlink::registry::RegistryError;
use soarlink::rest::mock::MockPlatform;
use soarlink::stomp::{SessionCommand, SessionEvent};
use soarlink::test_actions::TestActionServer;
use soarlink::{ChannelKey, Component, Handled, HandlerResult, Invocation, RuntimeError};

fn echo(queue: &str) -> Component {
    Component::new(format!("echo-{queue}")).on(
        ChannelKey::Actions(queue.to_string()),
        |inv: &Invocation| -> HandlerResult { Ok(Handled::status(inv.event().display_name())) },
    )
}

#[tokio::test]
async fn test_register_while_connected_subscribes_immediately() {
    let mut harness = Harness::start(vec![echo("q")]).await;
    assert_eq!(harness.subscriptions, vec!["actions.201.q"]);

    harness.handle.register(echo("other")).await.unwrap();
    assert_eq!(
        harness.session.next_command().await,
        SessionCommand::Subscribe {
            destination: "actions.201.other".to_string()
        }
    );

    // A second component on the same destination subscribes nothing new.
    harness
        .handle
        .register(Component::new("second").on(
            ChannelKey::Actions("q".to_string()),
            |_: &Invocation| -> HandlerResult { Ok(Handled::done()) },
        ))
        .await
        .unwrap();
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_register_unknown_function_fails() {
    let harness = Harness::start(vec![echo("q")]).await;
    let err = harness
        .handle
        .register(Component::new("fn").on(
            ChannelKey::Functions("missing".to_string()),
            |_: &Invocation| -> HandlerResult { Ok(Handled::done()) },
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Registry(RegistryError::UnknownFunction(name)) if name == "missing"
    ));

    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_component_name_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let component = Component::new("demo").on(
        ChannelKey::Actions("q".to_string()),
        move |_: &Invocation| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Handled::status("a"))
        },
    );
    let mut harness = Harness::start(vec![component.clone()]).await;

    let err = harness.handle.register(component).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Registry(RegistryError::AlreadyRegistered(name)) if name == "demo"
    ));
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));
    harness.expect_send().await;
    assert_eq!(common::body(&harness.expect_send().await)["message"], "a");
    harness.expect_ack().await;
    harness.expect_quiet(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_unregister_drops_subscription() {
    let mut harness = Harness::start(vec![echo("q")]).await;

    harness.handle.unregister("echo-q");
    assert_eq!(
        harness.session.next_command().await,
        SessionCommand::Unsubscribe {
            destination: "actions.201.q".to_string()
        }
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_reload_starts_new_session() {
    let mut harness = Harness::start(vec![echo("q")]).await;
    let api = Arc::new(MockPlatform::new().with_response(
        "/rest/orgs/201/actions",
        json!([{"id": 42, "name": "Run: Something Else"}]),
    ));

    harness
        .handle
        .reload(common::config(), api.clone())
        .await
        .unwrap();
    assert_eq!(api.connects(), 1);
    assert_eq!(api.resets(), 1);
    assert_eq!(harness.session.next_command().await, SessionCommand::Shutdown);
    assert_eq!(
        harness.handle.metadata().action_names.get(&42).map(String::as_str),
        Some("Run: Something Else")
    );

    let old = std::mem::replace(&mut harness.session, harness.factory.take_session().await);
    assert_eq!(harness.session.generation, 2);
    assert_eq!(harness.session.next_command().await, SessionCommand::Connect);
    assert_eq!(harness.connect().await, vec!["actions.201.q"]);

    // Messages from the replaced session are ignored.
    old.emit(SessionEvent::Message(message("stale", "stomp-q", &json!({"action_id": 42}))));
    harness.expect_quiet(Duration::from_millis(300)).await;

    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));
    assert_eq!(
        common::body(&harness.expect_send().await)["message"],
        "run_something_else"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_reload_keeps_session() {
    let mut harness = Harness::start(vec![echo("q")]).await;
    let api = Arc::new(MockPlatform::new());
    api.fail_connects(1);

    assert!(harness
        .handle
        .reload(common::config(), api)
        .await
        .is_err());
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));
    harness.expect_send().await;

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_session() {
    let mut harness = Harness::start(vec![echo("q")]).await;
    harness.handle.shutdown();
    assert_eq!(harness.session.next_command().await, SessionCommand::Shutdown);
    harness.session.emit(SessionEvent::Stopped);

    let result = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

fn request(msg_id: u32, text: &str) -> Bytes {
    let mut data = BytesMut::new();
    data.put_u32(msg_id);
    data.extend_from_slice(text.as_bytes());
    data.freeze()
}

async fn read_line(client: &mut Framed<TcpStream, LengthDelimitedCodec>) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("response timeout")
        .expect("server closed")
        .expect("read");
    String::from_utf8(frame.to_vec()).expect("utf-8 line")
}

#[tokio::test]
async fn test_action_server_runs_handlers_without_broker_traffic() {
    let mut harness = Harness::start(vec![echo("q")]).await;
    let server = TestActionServer::bind("127.0.0.1", 0, harness.handle.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(stream, LengthDelimitedCodec::new());
    client
        .send(request(5, r#"q {"action_id": 42, "incident": {"id": 2095}}"#))
        .await
        .unwrap();

    assert_eq!(read_line(&mut client).await, "Action Submitted<action 5>");
    let status = read_line(&mut client).await;
    assert!(status.starts_with("RESPONSE<action 5>: "));
    assert!(status.contains(r#""complete":false"#));
    let last = read_line(&mut client).await;
    assert!(last.contains(r#""complete":true"#));
    assert_eq!(
        read_line(&mut client).await,
        "Action Completed<action 5>: run_something\n"
    );

    client.send(request(6, "no_message_here")).await.unwrap();
    assert!(read_line(&mut client).await.starts_with("<action 6>: Submit actions"));

    client
        .send(request(7, r#"q {"action_id": 999}"#))
        .await
        .unwrap();
    assert_eq!(read_line(&mut client).await, "Action Submitted<action 7>");
    assert_eq!(
        read_line(&mut client).await,
        "Action Failed<action 7>: Action 999 is not defined"
    );

    harness.expect_quiet(Duration::from_millis(200)).await;
    harness.stop().await;
}
