//! Client library tests (wisp-client)
//!
//! Covers connection lifecycle, publish/subscribe delivery, subscription
//! limits, payload modes, and close semantics against an in-process server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wisp_client::{Client, ClientBuilder, ClientEvents, Error, Payload, PayloadMode, SubOptions};
use wisp_test_utils::{wait_for, MessageCollector, TestServer};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_and_close() {
    let server = TestServer::start().await;

    let client = Client::connect(&server.url()).await.expect("connect failed");
    assert!(client.is_connected());
    assert!(!client.is_closed());

    client.close();
    assert!(client.is_closed());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_double_close() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    client.close();
    client.close(); // second close is a no-op

    assert!(client.is_closed());
}

#[tokio::test]
async fn test_connect_refused() {
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        Client::connect("nats://127.0.0.1:1"),
    )
    .await;

    match result {
        Ok(Ok(_)) => panic!("should not connect to a closed port"),
        Ok(Err(_)) => {}
        Err(_) => panic!("connect should fail fast, not hang"),
    }
}

#[tokio::test]
async fn test_connect_bad_url() {
    let err = ClientBuilder::new("http://somewhere:4222")
        .connect()
        .await
        .expect_err("scheme should be rejected");
    assert_eq!(err.code(), "BAD_OPTIONS");
}

#[tokio::test]
async fn test_server_info_surface() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let info = client.server_info().expect("info after connect");
    assert_eq!(info.server_id, "wisp-test");

    client.close();
}

#[tokio::test]
async fn test_connect_sends_client_metadata() {
    let server = TestServer::start().await;
    let _client = ClientBuilder::new(&server.url())
        .name("metadata test")
        .connect()
        .await
        .expect("connect failed");

    assert!(
        wait_for(|| !server.connects().is_empty(), WAIT).await,
        "no CONNECT observed"
    );
    let connect = &server.connects()[0];
    assert_eq!(connect["lang"], "rust");
    assert_eq!(connect["protocol"], 1);
    assert_eq!(connect["name"], "metadata test");
}

// ============================================================================
// Publish / Subscribe
// ============================================================================

#[tokio::test]
async fn test_basic_pub_sub() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    let replies = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
    let r = replies.clone();

    client
        .subscribe("foo", move |msg| {
            r.lock().push(msg.reply.clone());
            c.push(&msg.subject, msg.data.as_str().unwrap_or(""));
        })
        .expect("subscribe failed");

    client.flush().await.expect("flush failed");
    client.publish("foo", "hello").expect("publish failed");

    assert!(collector.wait_for_count(1, WAIT).await, "message not delivered");
    let messages = collector.messages();
    assert_eq!(messages[0], ("foo".to_string(), "hello".to_string()));
    assert_eq!(replies.lock()[0], None);
    assert_eq!(client.num_subscriptions(), 1);

    client.close();
}

#[tokio::test]
async fn test_publish_does_not_deliver_to_other_subjects() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    client
        .subscribe("only.this", move |msg| {
            c.push(&msg.subject, msg.data.as_str().unwrap_or(""))
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("something.else", "x").expect("publish failed");
    client.publish("only.this", "y").expect("publish failed");

    assert!(collector.wait_for_count(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.count(), 1);
    assert_eq!(collector.payloads(), vec!["y"]);

    client.close();
}

#[tokio::test]
async fn test_queue_group_single_delivery() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let n = counter.clone();
        client
            .queue_subscribe("work", "workers", move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .expect("queue subscribe failed");
    }
    client.flush().await.expect("flush failed");

    client.publish("work", "job").expect("publish failed");

    assert!(wait_for(|| counter.load(Ordering::SeqCst) >= 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        1,
        "queue group must deliver to exactly one member"
    );

    client.close();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    let sid = client
        .subscribe("u.v", move |msg| {
            c.push(&msg.subject, msg.data.as_str().unwrap_or(""))
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("u.v", "one").expect("publish failed");
    assert!(collector.wait_for_count(1, WAIT).await);

    client.unsubscribe(sid).expect("unsubscribe failed");
    client.flush().await.expect("flush failed");
    assert_eq!(client.num_subscriptions(), 0);

    client.publish("u.v", "two").expect("publish failed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.count(), 1);

    client.close();
}

// ============================================================================
// Auto-unsubscribe
// ============================================================================

#[tokio::test]
async fn test_auto_unsubscribe_max() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    let unsubs = Arc::new(Mutex::new(Vec::<(i64, String)>::new()));

    struct Recorder(Arc<Mutex<Vec<(i64, String)>>>);
    impl ClientEvents for Recorder {
        fn on_unsubscribe(&self, sid: i64, subject: &str) {
            self.0.lock().push((sid, subject.to_string()));
        }
    }

    let client2 = ClientBuilder::new(&server.url())
        .events(Arc::new(Recorder(unsubs.clone())))
        .connect()
        .await
        .expect("connect failed");

    let sid = client2
        .subscribe_with(
            "bar",
            SubOptions {
                queue_group: None,
                max: Some(3),
            },
            move |msg| c.push(&msg.subject, msg.data.as_str().unwrap_or("")),
        )
        .expect("subscribe failed");
    client2.flush().await.expect("flush failed");

    for i in 0..5 {
        client.publish("bar", format!("m{i}")).expect("publish failed");
    }
    client.flush().await.expect("flush failed");

    assert!(collector.wait_for_count(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.count(), 3, "callback must fire exactly max times");
    assert_eq!(client2.num_subscriptions(), 0);

    let events = unsubs.lock().clone();
    assert_eq!(events, vec![(sid, "bar".to_string())]);

    client.close();
    client2.close();
}

// ============================================================================
// Payload Modes
// ============================================================================

#[tokio::test]
async fn test_json_roundtrip() {
    let server = TestServer::start().await;
    let client = ClientBuilder::new(&server.url())
        .payload(PayloadMode::Json)
        .connect()
        .await
        .expect("connect failed");

    let received = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
    let r = received.clone();
    client
        .subscribe("j", move |msg| {
            if let Payload::Json(v) = &msg.data {
                r.lock().push(v.clone());
            }
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    let value = serde_json::json!({"answer": 42, "items": ["a", "b"], "nested": {"ok": true}});
    client.publish_json("j", &value).expect("publish failed");

    assert!(wait_for(|| !received.lock().is_empty(), WAIT).await);
    assert_eq!(received.lock()[0], value);

    client.close();
}

#[tokio::test]
async fn test_json_parse_failure_delivered_as_message() {
    let server = TestServer::start().await;
    let client = ClientBuilder::new(&server.url())
        .payload(PayloadMode::Json)
        .connect()
        .await
        .expect("connect failed");

    let saw_error = Arc::new(AtomicUsize::new(0));
    let s = saw_error.clone();
    client
        .subscribe("badjson", move |msg| {
            if matches!(msg.data, Payload::JsonError(_)) {
                s.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("badjson", "{not valid json").expect("publish failed");

    assert!(
        wait_for(|| saw_error.load(Ordering::SeqCst) == 1, WAIT).await,
        "parse error must reach the callback as the message"
    );

    client.close();
}

#[tokio::test]
async fn test_binary_mode_preserves_bytes() {
    let server = TestServer::start().await;
    let client = ClientBuilder::new(&server.url())
        .payload(PayloadMode::Binary)
        .connect()
        .await
        .expect("connect failed");

    let payload: Vec<u8> = vec![0x00, 0xff, b'\r', b'\n', 0x7f];
    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let r = received.clone();
    client
        .subscribe("bin", move |msg| {
            if let Payload::Bytes(b) = &msg.data {
                r.lock().push(b.to_vec());
            }
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("bin", &payload).expect("publish failed");

    assert!(wait_for(|| !received.lock().is_empty(), WAIT).await);
    assert_eq!(received.lock()[0], payload);

    client.close();
}

// ============================================================================
// Validation and Close Semantics
// ============================================================================

#[tokio::test]
async fn test_bad_subjects_rejected() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    assert!(matches!(
        client.publish("", "x").unwrap_err(),
        Error::BadSubject
    ));
    assert!(matches!(
        client.publish("has space", "x").unwrap_err(),
        Error::BadSubject
    ));
    assert!(matches!(
        client.subscribe("a..b", |_| {}).unwrap_err(),
        Error::BadSubject
    ));
    assert!(matches!(
        client.publish_request("ok", "bad reply", "x").unwrap_err(),
        Error::BadReply
    ));

    client.close();
}

#[tokio::test]
async fn test_max_payload_enforced() {
    let server = TestServer::start_with_config(wisp_test_utils::TestServerConfig {
        max_payload: 16,
        ..Default::default()
    })
    .await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    client.publish("ok", "small").expect("small payload passes");
    let err = client
        .publish("ok", vec![b'x'; 64])
        .expect_err("oversized payload must fail");
    assert_eq!(err.code(), "BAD_MSG");

    client.close();
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");
    client.close();

    assert!(matches!(
        client.publish("x", "y").unwrap_err(),
        Error::ConnClosed
    ));
    assert!(matches!(
        client.subscribe("x", |_| {}).unwrap_err(),
        Error::ConnClosed
    ));
    assert!(client.flush().await.is_err());
}

#[tokio::test]
async fn test_no_callbacks_after_close() {
    let server = TestServer::start().await;
    let publisher = Client::connect(&server.url()).await.expect("connect failed");
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let counter = Arc::new(AtomicUsize::new(0));
    let n = counter.clone();
    client
        .subscribe("closing", move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.close();

    publisher.publish("closing", "late").expect("publish failed");
    publisher.flush().await.expect("flush failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 0, "no delivery after close");

    publisher.close();
}

#[tokio::test]
async fn test_callback_panic_becomes_error_event() {
    let server = TestServer::start().await;

    struct ErrorTracker(Arc<Mutex<Vec<String>>>);
    impl ClientEvents for ErrorTracker {
        fn on_error(&self, err: &Error) {
            self.0.lock().push(err.code().to_string());
        }
    }

    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = ClientBuilder::new(&server.url())
        .events(Arc::new(ErrorTracker(errors.clone())))
        .connect()
        .await
        .expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    client
        .subscribe("boom", |_| panic!("callback exploded"))
        .expect("subscribe failed");
    client
        .subscribe("fine", move |msg| {
            c.push(&msg.subject, msg.data.as_str().unwrap_or(""))
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("boom", "x").expect("publish failed");
    client.publish("fine", "still alive").expect("publish failed");

    assert!(
        collector.wait_for_count(1, WAIT).await,
        "parser loop must survive a panicking callback"
    );
    assert!(wait_for(|| !errors.lock().is_empty(), WAIT).await);

    client.close();
}

// ============================================================================
// Stats
// ============================================================================

#[tokio::test]
async fn test_stats_track_traffic() {
    let server = TestServer::start().await;
    let client = Client::connect(&server.url()).await.expect("connect failed");

    let collector = MessageCollector::new();
    let c = collector.clone();
    client
        .subscribe("counted", move |msg| {
            c.push(&msg.subject, msg.data.as_str().unwrap_or(""))
        })
        .expect("subscribe failed");
    client.flush().await.expect("flush failed");

    client.publish("counted", "0123456789").expect("publish failed");
    assert!(collector.wait_for_count(1, WAIT).await);

    let stats = client.stats();
    assert_eq!(stats.out_msgs, 1);
    assert_eq!(stats.in_msgs, 1);
    assert_eq!(stats.in_bytes, 10);
    assert!(stats.out_bytes > 0);

    client.close();
}
