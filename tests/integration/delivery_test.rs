//! Delivery guard end to end: failed acks and replies are retried on the
//! timer, and redeliveries after a reconnect are answered from the guard.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{body, message, Harness};
use soarlink::stomp::{
    Command, Frame, OutboundAck, OutboundReply, ReplyKind, SessionEvent, StompError,
};
use soarlink::{ChannelKey, Component, Handled, HandlerResult, Invocation};

fn counting(calls: Arc<AtomicUsize>) -> Component {
    Component::new("demo").on(
        ChannelKey::Actions("q".to_string()),
        move |_: &Invocation| -> HandlerResult {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Handled::status("done"))
        },
    )
}

/// Interim plus final reply, then the ack.
async fn run_to_ack(harness: &mut Harness, message_id: &str) -> (OutboundReply, OutboundAck) {
    harness.deliver(message(message_id, "stomp-q", &json!({"action_id": 42})));
    assert_eq!(harness.expect_send().await.kind, ReplyKind::Interim);
    let reply = harness.expect_send().await;
    assert_eq!(reply.kind, ReplyKind::Final);
    let ack = harness.expect_ack().await;
    assert_eq!(ack.message_id, message_id);
    (reply, ack)
}

#[tokio::test]
async fn test_rejected_ack_is_retried_on_tick() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut harness = Harness::start(vec![counting(calls.clone())]).await;
    let (_, ack) = run_to_ack(&mut harness, "m1").await;

    harness.session.emit(SessionEvent::AckOutcome {
        ack: ack.clone(),
        result: Err("broker rejected".to_string()),
    });

    let retried = harness.expect_ack().await;
    assert_eq!(retried, ack);
    harness.session.emit(SessionEvent::AckOutcome {
        ack: retried,
        result: Ok(()),
    });

    // Entry removed: the next tick issues nothing.
    harness.expect_quiet(Duration::from_millis(1500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_final_reply_is_retried() {
    let mut harness = Harness::start(vec![counting(Arc::default())]).await;
    let (reply, ack) = run_to_ack(&mut harness, "m2").await;

    harness.session.emit(SessionEvent::SendOutcome {
        reply: reply.clone(),
        result: Err("write failed".to_string()),
    });
    harness.session.emit(SessionEvent::AckOutcome {
        ack,
        result: Ok(()),
    });

    let retried = harness.expect_send().await;
    assert_eq!(retried, reply);
    harness.session.emit(SessionEvent::SendOutcome {
        reply: retried,
        result: Ok(()),
    });
    harness.expect_quiet(Duration::from_millis(1500)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_retries_give_up_after_max() {
    let mut config = common::config();
    config.options.stomp_max_retries = 1;
    let mut harness = Harness::start_with(config, vec![counting(Arc::default())]).await;
    let (_, ack) = run_to_ack(&mut harness, "m3").await;

    harness.session.emit(SessionEvent::AckOutcome {
        ack: ack.clone(),
        result: Err("broker rejected".to_string()),
    });
    let retried = harness.expect_ack().await;
    harness.session.emit(SessionEvent::AckOutcome {
        ack: retried,
        result: Err("broker rejected".to_string()),
    });

    harness.expect_quiet(Duration::from_millis(1500)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_interim_failures_are_not_retried() {
    let mut harness = Harness::start(vec![counting(Arc::default())]).await;
    harness.deliver(message("m4", "stomp-q", &json!({"action_id": 42})));
    let interim = harness.expect_send().await;
    assert_eq!(interim.kind, ReplyKind::Interim);
    harness.expect_send().await;
    harness.expect_ack().await;

    harness.session.emit(SessionEvent::SendOutcome {
        reply: interim,
        result: Err("write failed".to_string()),
    });
    harness.expect_quiet(Duration::from_millis(1500)).await;

    harness.stop().await;
}

/// Reconnect + redelivery: the pending ack is replayed, the handler is not rerun.
#[tokio::test]
async fn test_redelivery_after_reconnect_replays_ack() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut harness = Harness::start(vec![counting(calls.clone())]).await;
    let (reply, ack) = run_to_ack(&mut harness, "m1").await;

    harness.session.emit(SessionEvent::Disconnected { reconnect: true });
    harness.session.emit(SessionEvent::SendOutcome {
        reply,
        result: Ok(()),
    });
    harness.session.emit(SessionEvent::AckOutcome {
        ack,
        result: Err("connection lost".to_string()),
    });

    let subscriptions = harness.connect().await;
    assert_eq!(subscriptions, harness.subscriptions);

    // Held from the previous session: not retried on the timer.
    harness.expect_quiet(Duration::from_millis(1300)).await;

    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));
    assert_eq!(harness.expect_ack().await.message_id, "m1");
    harness.expect_quiet(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The entry was cleared: a further redelivery runs the handler again.
    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));
    harness.expect_send().await;
    harness.expect_send().await;
    harness.expect_ack().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_redelivery_replays_reply_to_new_reply_to() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut harness = Harness::start(vec![counting(calls.clone())]).await;
    let (reply, ack) = run_to_ack(&mut harness, "m5").await;

    harness.session.emit(SessionEvent::Disconnected { reconnect: true });
    harness.session.emit(SessionEvent::SendOutcome {
        reply: reply.clone(),
        result: Err("connection lost".to_string()),
    });
    harness.session.emit(SessionEvent::AckOutcome {
        ack,
        result: Err("connection lost".to_string()),
    });
    harness.connect().await;

    let redelivered = Frame::new(Command::Message)
        .with_header("message-id", "m5")
        .with_header("reply-to", "R2")
        .with_header("correlation-id", "c2")
        .with_header("subscription", "stomp-q")
        .with_body(json!({"action_id": 42}).to_string().into_bytes());
    harness.deliver(redelivered);

    let replayed = harness.expect_send().await;
    assert_eq!(replayed.destination, "R2");
    assert_eq!(replayed.correlation_id.as_deref(), Some("c2"));
    assert_eq!(body(&replayed), body(&reply));
    assert_eq!(harness.expect_ack().await.message_id, "m5");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_no_retries_while_disconnected() {
    let mut harness = Harness::start(vec![counting(Arc::default())]).await;
    let (_, ack) = run_to_ack(&mut harness, "m6").await;

    harness.session.emit(SessionEvent::Disconnected { reconnect: true });
    harness.session.emit(SessionEvent::AckOutcome {
        ack,
        result: Err("connection lost".to_string()),
    });
    harness.expect_quiet(Duration::from_millis(1500)).await;

    harness.stop().await;
}

/// A handler still running when the connection drops finishes; its reply and
/// ack fail on the reconnecting session and are answered from the guard when
/// the broker redelivers.
#[tokio::test]
async fn test_in_flight_handler_finishes_across_reconnect() {
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let component = Component::new("slow").on(
        ChannelKey::Actions("q".to_string()),
        move |_: &Invocation| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(Handled::status("done"))
        },
    );
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m7", "stomp-q", &json!({"action_id": 42})));
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler started");

    harness.session.emit(SessionEvent::Disconnected { reconnect: true });
    harness.expect_quiet(Duration::from_millis(200)).await;
    release.send(()).unwrap();

    let not_connected = StompError::NotConnected.to_string();
    let interim = harness.expect_send().await;
    assert_eq!(interim.kind, ReplyKind::Interim);
    let reply = harness.expect_send().await;
    assert_eq!(reply.kind, ReplyKind::Final);
    let ack = harness.expect_ack().await;
    assert_eq!(ack.message_id, "m7");
    harness.session.emit(SessionEvent::SendOutcome {
        reply: interim,
        result: Err(not_connected.clone()),
    });
    harness.session.emit(SessionEvent::SendOutcome {
        reply: reply.clone(),
        result: Err(not_connected.clone()),
    });
    harness.session.emit(SessionEvent::AckOutcome {
        ack,
        result: Err(not_connected),
    });
    harness.expect_quiet(Duration::from_millis(1300)).await;

    assert_eq!(harness.connect().await, harness.subscriptions);
    // Held from the dropped connection: the tick leaves them alone.
    harness.expect_quiet(Duration::from_millis(1300)).await;

    harness.deliver(message("m7", "stomp-q", &json!({"action_id": 42})));
    let replayed = harness.expect_send().await;
    assert_eq!(body(&replayed), body(&reply));
    assert_eq!(harness.expect_ack().await.message_id, "m7");
    harness.expect_quiet(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.stop().await;
}
