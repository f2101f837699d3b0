//! End-to-end client tests against an in-process server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::FakeServer;
use natswire_client::{
    default_client, Client, ConnectionState, Diagnostic, FnHandler, HandlerError, Headers,
    Message, NatsError, ReconnectPolicy, Reply, SubscribeOptions, Subscription,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(server: &FakeServer) -> Client {
    Client::builder()
        .name("test")
        .reconnect(ReconnectPolicy::fixed(Duration::from_millis(20), 100))
        .connect("127.0.0.1", server.port)
        .await
        .unwrap()
}

/// Subscribe a handler that forwards every message to a channel.
fn forward(client: &Client, subject: &str) -> (Subscription, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = client
        .subscribe(subject, move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    (sub, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[tokio::test]
async fn test_publish_subscribe_roundtrip() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.server_info().server_id, "FAKE");

    let (_sub, mut rx) = forward(&client, "greet.*");
    client.publish("greet.alice", "hello").unwrap();
    client.publish("other.topic", "ignored").unwrap();
    client.publish("greet.bob", "hi").unwrap();
    client.flush(WAIT).await.unwrap();

    let first = recv(&mut rx).await;
    assert_eq!(first.subject, "greet.alice");
    assert_eq!(first.payload_str(), Some("hello"));
    assert!(first.headers.is_none());
    assert_eq!(recv(&mut rx).await.subject, "greet.bob");

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_headers_are_delivered() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let (_sub, mut rx) = forward(&client, "traced");
    let headers = Headers::new()
        .with("Trace-Id", "abc")
        .with("Trace-Id", "def");
    client
        .publish_with_headers("traced", headers, "payload")
        .unwrap();

    let msg = recv(&mut rx).await;
    let headers = msg.headers.as_ref().expect("headers");
    assert_eq!(
        headers.get_all("Trace-Id").collect::<Vec<_>>(),
        vec!["abc", "def"]
    );
    assert_eq!(msg.payload_str(), Some("payload"));
}

#[tokio::test]
async fn test_subscription_message_budget() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client
        .subscribe_with(
            "budget",
            SubscribeOptions::new().max_msgs(2),
            FnHandler::new(move |msg: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .unwrap();

    for i in 0..5 {
        client.publish("budget", format!("m{}", i)).unwrap();
    }
    client.flush(WAIT).await.unwrap();

    assert_eq!(recv(&mut rx).await.payload_str(), Some("m0"));
    assert_eq!(recv(&mut rx).await.payload_str(), Some("m1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert!(!sub.is_active());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let (sub, mut rx) = forward(&client, "topic");
    client.publish("topic", "one").unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), Some("one"));

    sub.unsubscribe().await.unwrap();
    assert_eq!(client.subscription_count(), 0);
    client.publish("topic", "two").unwrap();
    client.flush(WAIT).await.unwrap();
    assert!(matches!(
        sub.unsubscribe().await,
        Err(NatsError::SubscriptionNotFound(_))
    ));
}

#[tokio::test]
async fn test_queue_group_delivers_once() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let count = count.clone();
        client
            .queue_subscribe("jobs", "workers", move |_msg: Message| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
    }

    for _ in 0..4 {
        client.publish("jobs", "work").unwrap();
    }
    client.flush(WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_request_reply() {
    let server = FakeServer::start().await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    service
        .reply("math.double", |msg: Message| async move {
            let n: u64 = msg.payload_str().unwrap_or("0").parse()?;
            Ok::<_, HandlerError>((n * 2).to_string())
        })
        .unwrap();
    service.flush(WAIT).await.unwrap();

    let reply = caller.request("math.double", "21").await.unwrap();
    assert_eq!(reply.payload_str(), Some("42"));
    assert!(reply.subject.starts_with("_INBOX."));
}

#[tokio::test]
async fn test_reply_with_headers() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    client
        .reply("whoami", |_msg: Message| async move {
            Ok::<_, HandlerError>(Reply::with_headers(
                "svc-1",
                Headers::new().with("Instance", "1"),
            ))
        })
        .unwrap();

    let reply = client.request("whoami", "").await.unwrap();
    assert_eq!(reply.payload_str(), Some("svc-1"));
    assert_eq!(
        reply.headers.as_ref().and_then(|h| h.get("Instance")),
        Some("1")
    );
}

struct Celsius(f64);

impl TryFrom<Message> for Celsius {
    type Error = HandlerError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        let text = msg.payload_str().ok_or("not UTF-8")?;
        Ok(Celsius(text.trim().parse()?))
    }
}

#[tokio::test]
async fn test_typed_reply() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;
    let mut diagnostics = client.diagnostics();

    client
        .reply_typed("convert.fahrenheit", |c: Celsius| async move {
            Ok::<_, HandlerError>(format!("{:.1}", c.0 * 9.0 / 5.0 + 32.0))
        })
        .unwrap();

    let reply = client.request("convert.fahrenheit", "100").await.unwrap();
    assert_eq!(reply.payload_str(), Some("212.0"));

    // Unconvertible requests get no answer and surface as handler errors.
    let result = client
        .request_timeout("convert.fahrenheit", "hot", Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(NatsError::NoReplies)));
    let event = timeout(WAIT, async {
        loop {
            if let Ok(Diagnostic::HandlerFailed { .. }) = diagnostics.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(event.is_ok());
}

#[tokio::test]
async fn test_request_no_responders() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let started = tokio::time::Instant::now();
    let err = client.request("nobody.home", "?").await.unwrap_err();
    assert!(matches!(err, NatsError::NoResponders));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_request_zero_timeout_fails_fast() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    // Receives the request but never answers.
    let (_sub, _rx) = forward(&client, "silent");
    client.flush(WAIT).await.unwrap();

    let err = client
        .request_timeout("silent", "?", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, NatsError::NoReplies));
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn test_request_many_returns_partial_results() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    for id in 0..2 {
        client
            .reply("census", move |_msg: Message| async move {
                Ok::<_, HandlerError>(format!("member-{}", id))
            })
            .unwrap();
    }
    client.flush(WAIT).await.unwrap();

    let replies = client
        .request_many("census", "", 5, Duration::from_millis(200))
        .await
        .unwrap();
    let mut names: Vec<_> = replies
        .iter()
        .filter_map(|m| m.payload_str().map(str::to_string))
        .collect();
    names.sort();
    assert_eq!(names, vec!["member-0", "member-1"]);
}

#[tokio::test]
async fn test_publish_validation() {
    let server = FakeServer::start_with(16).await;
    let client = connect(&server).await;

    assert!(matches!(
        client.publish("bad subject", "x"),
        Err(NatsError::Validation(_))
    ));
    assert!(matches!(
        client.publish("wild.*", "x"),
        Err(NatsError::Validation(_))
    ));
    assert!(matches!(
        client.publish("big", vec![0u8; 17]),
        Err(NatsError::PayloadTooLarge { size: 17, max: 16 })
    ));
    assert!(client.publish("small", vec![0u8; 16]).is_ok());
}

#[tokio::test]
async fn test_publish_fails_fast_when_buffer_full() {
    let server = FakeServer::start().await;
    let client = Client::builder()
        .max_pending_frames(4)
        .connect("127.0.0.1", server.port)
        .await
        .unwrap();

    // Nothing yields between publishes, so the writer cannot drain.
    let mut results = Vec::new();
    for _ in 0..10 {
        results.push(client.publish("flood", "x"));
    }
    assert!(results[..4].iter().all(Result::is_ok));
    assert!(matches!(results[4], Err(NatsError::Capacity)));
    assert!(client.is_backpressure_active());

    // Control traffic still gets through.
    client.flush(WAIT).await.unwrap();
    assert!(!client.is_backpressure_active());
    assert!(client.publish("flood", "x").is_ok());
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;
    let mut diagnostics = client.diagnostics();

    let (_sub, mut rx) = forward(&client, "durable");
    client.flush(WAIT).await.unwrap();

    server.kill_connections();

    let reconnected = timeout(WAIT, async {
        loop {
            match diagnostics.recv().await {
                Ok(Diagnostic::Reconnected { .. }) => break,
                Ok(_) => continue,
                Err(e) => panic!("diagnostics closed: {}", e),
            }
        }
    })
    .await;
    assert!(reconnected.is_ok(), "client did not reconnect");
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.accepted(), 2);

    client.publish("durable", "after").unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), Some("after"));
}

#[tokio::test]
async fn test_publishes_during_outage_are_sent_after_reconnect() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;
    let (_sub, mut rx) = forward(&client, "buffered");
    client.flush(WAIT).await.unwrap();

    let mut states = client.state_changes();
    server.kill_connections();
    timeout(
        WAIT,
        states.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    client.publish("buffered", "queued").unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), Some("queued"));
}

#[tokio::test]
async fn test_drain_finishes_buffered_messages() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    client
        .subscribe("slow", move |_msg: Message| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    for _ in 0..5 {
        client.publish("slow", "work").unwrap();
    }
    client.flush(WAIT).await.unwrap();

    let draining = client.clone();
    let drain = tokio::spawn(async move { draining.drain().await });

    let mut states = client.state_changes();
    timeout(WAIT, states.wait_for(|s| *s != ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client.publish("slow", "late"),
        Err(NatsError::Drained)
    ));

    timeout(WAIT, drain).await.unwrap().unwrap().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 5);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.publish("slow", "closed"),
        Err(NatsError::Drained)
    ));
    assert!(matches!(
        client.subscribe("slow", |_msg: Message| async { Ok::<(), HandlerError>(()) }),
        Err(NatsError::Drained)
    ));
    // Draining again is a no-op.
    client.drain().await.unwrap();
}

#[tokio::test]
async fn test_handler_errors_are_reported() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;
    let mut diagnostics = client.diagnostics();

    let sub = client
        .subscribe("fragile", |_msg: Message| async move {
            Err::<(), HandlerError>("cannot handle".into())
        })
        .unwrap();
    client.publish("fragile", "x").unwrap();

    let report = timeout(WAIT, async {
        loop {
            if let Ok(Diagnostic::HandlerFailed { sid, error, .. }) = diagnostics.recv().await {
                return (sid, error);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(report.0, sub.sid());
    assert!(report.1.contains("cannot handle"));
    assert!(sub.is_active());
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let server = FakeServer::start().await;
    let port = server.port;
    drop(server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .connect("127.0.0.1", port)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_default_client() {
    let server = FakeServer::start().await;
    let client = connect(&server).await;

    assert!(default_client::get().is_none());
    default_client::set_default(client.clone()).unwrap();
    assert!(default_client::set_default(client.clone()).is_err());

    let (_sub, mut rx) = forward(&client, "via.default");
    default_client::get()
        .unwrap()
        .publish("via.default", "ok")
        .unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), Some("ok"));

    assert!(default_client::clear().is_some());
    assert!(default_client::get().is_none());
}
