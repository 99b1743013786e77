//! End-to-end dispatch: delivered frame in, replies and ack out.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{body, message, Harness, CORRELATION_ID, REPLY_TO};
use soarlink::stomp::ReplyKind;
use soarlink::{ChannelKey, Component, Handled, HandlerError, HandlerResult, Invocation, TypedEvent};

fn actions(queue: &str) -> ChannelKey {
    ChannelKey::Actions(queue.to_string())
}

fn functions(name: &str) -> ChannelKey {
    ChannelKey::Functions(name.to_string())
}

/// Action success: one interim, one final, one ack.
#[tokio::test]
async fn test_action_success() {
    let names = Arc::new(Mutex::new(Vec::new()));
    let seen = names.clone();
    let component = Component::new("demo").on(actions("q"), move |inv: &Invocation| -> HandlerResult {
        if let TypedEvent::Action(action) = inv.event() {
            seen.lock().unwrap().push(action.name.clone());
        }
        Ok(Handled::status("hello"))
    });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m1", "stomp-q", &json!({"action_id": 42})));

    let interim = harness.expect_send().await;
    assert_eq!(interim.kind, ReplyKind::Interim);
    assert_eq!(interim.destination, REPLY_TO);
    assert_eq!(interim.correlation_id.as_deref(), Some(CORRELATION_ID));
    assert_eq!(
        body(&interim),
        json!({"message_type": 0, "message": "hello", "complete": false})
    );

    let last = harness.expect_send().await;
    assert_eq!(last.kind, ReplyKind::Final);
    assert_eq!(
        body(&last),
        json!({"message_type": 0, "message": "hello", "complete": true})
    );

    let ack = harness.expect_ack().await;
    assert_eq!(ack.message_id, "m1");
    assert_eq!(names.lock().unwrap().as_slice(), ["run_something".to_string()]);

    harness.stop().await;
}

#[tokio::test]
async fn test_subscriptions_follow_bindings() {
    let component = Component::new("demo")
        .on(actions("q"), |_: &Invocation| -> HandlerResult { Ok(Handled::done()) })
        .on(functions("fn_sum"), |_: &Invocation| -> HandlerResult { Ok(Handled::done()) });
    let harness = Harness::start(vec![component]).await;

    let mut destinations = harness.subscriptions.clone();
    destinations.sort();
    assert_eq!(destinations, vec!["actions.201.fn_queue", "actions.201.q"]);

    harness.stop().await;
}

/// Function success: results in the final reply, no interim.
#[tokio::test]
async fn test_function_success() {
    let component = Component::new("sum").on(functions("fn_sum"), |inv: &Invocation| -> HandlerResult {
        let TypedEvent::Function(function) = inv.event() else {
            return Err(HandlerError::new("TypeError", "not a function"));
        };
        let sum = function.inputs["a"].as_i64().unwrap_or(0) + function.inputs["b"].as_i64().unwrap_or(0);
        Ok(Handled::result(json!({"sum": sum})))
    });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message(
        "m2",
        "actions.201.fn_queue",
        &json!({"function": {"id": 7, "name": "fn_sum"}, "inputs": {"a": 1, "b": 2}}),
    ));

    let reply = harness.expect_send().await;
    assert_eq!(reply.kind, ReplyKind::Final);
    assert_eq!(
        body(&reply),
        json!({"message_type": 0, "message": "Completed", "complete": true, "results": {"sum": 3}})
    );
    assert_eq!(harness.expect_ack().await.message_id, "m2");

    harness.stop().await;
}

/// Function error: failure reply carrying the error and trace, then the ack.
#[tokio::test]
async fn test_function_error() {
    let component = Component::new("sum").on(functions("fn_sum"), |_: &Invocation| -> HandlerResult {
        Err(HandlerError::new("ValueError", "a must be positive").with_trace("at sum (fn_sum.rs:12)"))
    });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message(
        "m3",
        "actions.201.fn_queue",
        &json!({"function": {"id": 7, "name": "fn_sum"}, "inputs": {"a": -1}}),
    ));

    let reply = harness.expect_send().await;
    assert_eq!(reply.kind, ReplyKind::Final);
    assert_eq!(
        body(&reply),
        json!({
            "message_type": 1,
            "message": "ValueError: <a must be positive>\nat sum (fn_sum.rs:12)",
            "complete": true
        })
    );
    assert_eq!(harness.expect_ack().await.message_id, "m3");
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_stack_trace_omitted_when_disabled() {
    let component = Component::new("sum").on(functions("fn_sum"), |_: &Invocation| -> HandlerResult {
        Err(HandlerError::new("ValueError", "nope").with_trace("frame 0"))
    });
    let mut config = common::config();
    config.options.include_stack_trace = false;
    let mut harness = Harness::start_with(config, vec![component]).await;

    harness.deliver(message(
        "m3",
        "actions.201.fn_queue",
        &json!({"function": {"name": "fn_sum"}}),
    ));
    assert_eq!(body(&harness.expect_send().await)["message"], "ValueError: <nope>");
    harness.expect_ack().await;

    harness.stop().await;
}

/// Deferral: no ack on the first visit, one reply and one ack on the second.
#[tokio::test]
async fn test_deferral() {
    let visits = Arc::new(AtomicUsize::new(0));
    let counter = visits.clone();
    let component = Component::new("slow").on(actions("q"), move |inv: &Invocation| -> HandlerResult {
        counter.fetch_add(1, Ordering::SeqCst);
        if !inv.deferred {
            return inv.defer();
        }
        Ok(Handled::done())
    });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m6", "stomp-q", &json!({"action_id": 42})));
    harness.expect_quiet(Duration::from_millis(400)).await;
    assert_eq!(visits.load(Ordering::SeqCst), 1);

    let reply = harness.expect_send().await;
    assert_eq!(reply.kind, ReplyKind::Final);
    assert_eq!(body(&reply)["message_type"], 0);
    assert_eq!(harness.expect_ack().await.message_id, "m6");
    assert_eq!(visits.load(Ordering::SeqCst), 2);
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_unbound_channel_fails_and_acks() {
    let component = Component::new("demo").on(actions("q"), |_: &Invocation| -> HandlerResult { Ok(Handled::done()) });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m7", "stomp-other", &json!({"action_id": 42})));

    let reply = harness.expect_send().await;
    assert_eq!(body(&reply)["message_type"], 1);
    assert_eq!(harness.expect_ack().await.message_id, "m7");

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_action_refreshes_definitions() {
    let component = Component::new("demo").on(actions("q"), |inv: &Invocation| -> HandlerResult {
        Ok(Handled::status(inv.event().display_name()))
    });
    let mut harness = Harness::start(vec![component]).await;
    harness.platform.set_response(
        "/rest/orgs/201/actions",
        json!({"entities": [{"id": 42, "name": "Run: Something"}, {"id": 77, "name": "Late Action"}]}),
    );

    harness.deliver(message("m8", "stomp-q", &json!({"action_id": 77})));

    assert_eq!(body(&harness.expect_send().await)["message"], "late_action");
    assert_eq!(body(&harness.expect_send().await)["complete"], true);
    assert_eq!(harness.expect_ack().await.message_id, "m8");
    assert_eq!(harness.platform.gets("/rest/orgs/201/actions"), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_action_still_unknown_stays_unacked() {
    let component = Component::new("demo").on(actions("q"), |_: &Invocation| -> HandlerResult { Ok(Handled::done()) });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m9", "stomp-q", &json!({"action_id": 404})));
    harness.expect_quiet(Duration::from_millis(300)).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_message_id_is_acked_without_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let component = Component::new("demo").on(actions("q"), move |_: &Invocation| -> HandlerResult {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Handled::done())
    });
    let mut harness = Harness::start(vec![component]).await;

    let frame = soarlink::stomp::Frame::new(soarlink::stomp::Command::Message)
        .with_header("subscription", "stomp-q")
        .with_header("ack", "ack-1")
        .with_body(b"{}".to_vec());
    harness.deliver(frame);

    harness.expect_ack().await;
    harness.expect_quiet(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_undecodable_payload_policy() {
    let component = Component::new("demo").on(actions("q"), |_: &Invocation| -> HandlerResult { Ok(Handled::done()) });
    let mut harness = Harness::start(vec![component.clone()]).await;
    harness.deliver(message("m10", "stomp-q", &json!({})).with_body(b"not json".to_vec()));
    harness.expect_quiet(Duration::from_millis(200)).await;
    harness.stop().await;

    let mut config = common::config();
    config.options.ignore_message_failure = true;
    let mut harness = Harness::start_with(config, vec![component]).await;
    harness.deliver(message("m11", "stomp-q", &json!({})).with_body(b"not json".to_vec()));
    assert_eq!(harness.expect_ack().await.message_id, "m11");
    harness.stop().await;
}

#[tokio::test]
async fn test_low_code_response_posted() {
    let component = Component::new("forms").on(ChannelKey::LowCode, |inv: &Invocation| -> HandlerResult {
        let TypedEvent::LowCode(low_code) = inv.event() else {
            return Err(HandlerError::new("TypeError", "not low-code"));
        };
        Ok(Handled::result(json!({"echo": low_code.request_payload})))
    });
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message(
        "m12",
        "lc.201.forms",
        &json!({"request_payload": {"x": 1}, "response_ack": "/rest/orgs/201/low_code/ack/9"}),
    ));

    let reply = harness.expect_send().await;
    assert_eq!(body(&reply)["results"], json!({"echo": {"x": 1}}));
    assert_eq!(harness.expect_ack().await.message_id, "m12");

    let mut posts = Vec::new();
    for _ in 0..50 {
        posts = harness.platform.posts();
        if !posts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "/rest/orgs/201/low_code/ack/9");
    assert_eq!(posts[0].1["results"], json!({"echo": {"x": 1}}));

    harness.stop().await;
}

#[tokio::test]
async fn test_inbound_messages_get_no_reply() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let component = Component::new("inbound").on(
        ChannelKey::Inbound("feed".to_string()),
        move |_: &Invocation| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Handled::status("seen"))
        },
    );
    let mut harness = Harness::start(vec![component]).await;

    harness.deliver(message("m13", "inbound.201.feed", &json!({"object": {"id": 5}})));

    assert_eq!(harness.expect_ack().await.message_id, "m13");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    harness.expect_quiet(Duration::from_millis(200)).await;

    harness.stop().await;
}
