//! End-to-end client tests against an in-process mock broker.
//!
//! The mock broker speaks just enough of the wire protocol to exercise the
//! client: INFO greeting, CONNECT/PING/PONG, SUB/UNSUB bookkeeping, and
//! PUB/HPUB routing back to matching subscriptions (including no-responders
//! status replies). Connections can be killed on demand to drive the
//! reconnect path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use wirebus::{Client, ClientError, ConnectOptions, HeaderMap, Status};

struct BrokerShared {
    /// Every SUB line observed, tagged with the connection ordinal
    sub_log: Mutex<Vec<(usize, String)>>,
    connections: AtomicUsize,
    kick: broadcast::Sender<()>,
    connect_urls: Vec<String>,
    /// When set, each connection answers only this many PINGs
    pong_limit: Option<usize>,
}

struct MockBroker {
    addr: std::net::SocketAddr,
    shared: Arc<BrokerShared>,
}

struct MockSub {
    sid: u64,
    pattern: String,
    remaining: Option<u64>,
}

impl MockBroker {
    async fn start() -> Self {
        Self::start_inner(Vec::new(), None).await
    }

    async fn start_with_gossip(connect_urls: Vec<String>) -> Self {
        Self::start_inner(connect_urls, None).await
    }

    /// A broker that goes silent after answering `limit` PINGs per connection
    async fn start_with_pong_limit(limit: usize) -> Self {
        Self::start_inner(Vec::new(), Some(limit)).await
    }

    async fn start_inner(connect_urls: Vec<String>, pong_limit: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kick, _) = broadcast::channel(4);
        let shared = Arc::new(BrokerShared {
            sub_log: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            kick,
            connect_urls,
            pong_limit,
        });
        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_id = accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(serve_connection(stream, shared, conn_id));
            }
        });
        Self { addr, shared }
    }

    fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Abruptly drop every live connection
    fn kick_connections(&self) {
        let _ = self.shared.kick.send(());
    }

    fn sub_lines(&self, conn_id: usize) -> Vec<String> {
        self.shared
            .sub_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == conn_id)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<BrokerShared>, conn_id: usize) {
    let (read_half, mut write) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let urls = if shared.connect_urls.is_empty() {
        String::new()
    } else {
        let quoted: Vec<String> = shared
            .connect_urls
            .iter()
            .map(|u| format!("\"{u}\""))
            .collect();
        format!(",\"connect_urls\":[{}]", quoted.join(","))
    };
    let info = format!(
        "INFO {{\"server_id\":\"mock-{conn_id}\",\"max_payload\":1048576,\"proto\":1,\"headers\":true{urls}}}\r\n"
    );
    if write.write_all(info.as_bytes()).await.is_err() {
        return;
    }

    let mut subs: Vec<MockSub> = Vec::new();
    let mut kick = shared.kick.subscribe();
    let mut pongs_sent = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            r = reader.read_line(&mut line) => r,
            _ = kick.recv() => return,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let trimmed = line.trim_end().to_string();
        let mut parts = trimmed.split_whitespace();
        match parts.next().unwrap_or("") {
            "CONNECT" | "PONG" => {}
            "PING" => {
                if shared.pong_limit.map_or(true, |limit| pongs_sent < limit) {
                    pongs_sent += 1;
                    if write.write_all(b"PONG\r\n").await.is_err() {
                        return;
                    }
                }
            }
            "SUB" => {
                let args: Vec<&str> = parts.collect();
                let (pattern, sid) = match args.len() {
                    2 => (args[0], args[1]),
                    3 => (args[0], args[2]),
                    _ => continue,
                };
                shared
                    .sub_log
                    .lock()
                    .unwrap()
                    .push((conn_id, trimmed.clone()));
                subs.push(MockSub {
                    sid: sid.parse().unwrap(),
                    pattern: pattern.to_string(),
                    remaining: None,
                });
            }
            "UNSUB" => {
                let args: Vec<&str> = parts.collect();
                let sid: u64 = args[0].parse().unwrap();
                match args.get(1) {
                    Some(max) => {
                        let max: u64 = max.parse().unwrap();
                        if let Some(sub) = subs.iter_mut().find(|s| s.sid == sid) {
                            sub.remaining = Some(max);
                        }
                    }
                    None => subs.retain(|s| s.sid != sid),
                }
            }
            "PUB" => {
                let args: Vec<&str> = parts.collect();
                let (subject, reply, len) = match args.len() {
                    2 => (args[0].to_string(), None, args[1]),
                    3 => (args[0].to_string(), Some(args[1].to_string()), args[2]),
                    _ => continue,
                };
                let len: usize = len.parse().unwrap();
                let mut payload = vec![0u8; len + 2];
                if reader.read_exact(&mut payload).await.is_err() {
                    return;
                }
                payload.truncate(len);
                if route(&mut subs, &mut write, &subject, reply.as_deref(), None, &payload)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            "HPUB" => {
                let args: Vec<&str> = parts.collect();
                let (subject, reply, hlen, total) = match args.len() {
                    3 => (args[0].to_string(), None, args[1], args[2]),
                    4 => (
                        args[0].to_string(),
                        Some(args[1].to_string()),
                        args[2],
                        args[3],
                    ),
                    _ => continue,
                };
                let hlen: usize = hlen.parse().unwrap();
                let total: usize = total.parse().unwrap();
                let mut data = vec![0u8; total + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                data.truncate(total);
                let headers = data[..hlen].to_vec();
                let payload = data[hlen..].to_vec();
                if route(
                    &mut subs,
                    &mut write,
                    &subject,
                    reply.as_deref(),
                    Some(&headers),
                    &payload,
                )
                .await
                .is_err()
                {
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn route(
    subs: &mut Vec<MockSub>,
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut matched = false;
    let mut finished = Vec::new();
    for sub in subs.iter_mut() {
        if !subject_matches(&sub.pattern, subject) {
            continue;
        }
        if let Some(remaining) = &mut sub.remaining {
            if *remaining == 0 {
                finished.push(sub.sid);
                continue;
            }
            *remaining -= 1;
            if *remaining == 0 {
                finished.push(sub.sid);
            }
        }
        matched = true;
        deliver(write, subject, sub.sid, reply, headers, payload).await?;
    }
    subs.retain(|s| !finished.contains(&s.sid));

    if !matched {
        if let Some(reply) = reply {
            // nothing is listening on the request subject
            let status = b"NATS/1.0 503\r\n\r\n";
            for sub in subs.iter() {
                if subject_matches(&sub.pattern, reply) {
                    deliver(write, reply, sub.sid, None, Some(status), b"").await?;
                }
            }
        }
    }
    Ok(())
}

async fn deliver(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    subject: &str,
    sid: u64,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> std::io::Result<()> {
    let reply_part = reply.map(|r| format!("{r} ")).unwrap_or_default();
    match headers {
        Some(headers) => {
            let head = format!(
                "HMSG {subject} {sid} {reply_part}{} {}\r\n",
                headers.len(),
                headers.len() + payload.len()
            );
            write.write_all(head.as_bytes()).await?;
            write.write_all(headers).await?;
        }
        None => {
            let head = format!("MSG {subject} {sid} {reply_part}{}\r\n", payload.len());
            write.write_all(head.as_bytes()).await?;
        }
    }
    write.write_all(payload).await?;
    write.write_all(b"\r\n").await
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pt = pattern.split('.');
    let mut st = subject.split('.');
    loop {
        match (pt.next(), st.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn fast_options() -> ConnectOptions {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    ConnectOptions::new()
        .no_randomize(true)
        .reconnect_wait(Duration::from_millis(50))
        .reconnect_jitter(Duration::ZERO, Duration::ZERO)
        .connect_timeout(Duration::from_secs(1))
}

async fn connect_client(broker: &MockBroker) -> Client {
    fast_options().connect(broker.url()).await.unwrap()
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_publish_subscribe_fifo_order() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.subscribe("orders.*").await.unwrap();
    for i in 0..50u32 {
        client
            .publish("orders.created", i.to_be_bytes().to_vec())
            .await
            .unwrap();
    }
    client.flush(WAIT).await.unwrap();

    for expected in 0..50u32 {
        let msg = sub.next_timeout(WAIT).await.unwrap();
        let got = u32::from_be_bytes(msg.payload.as_ref().try_into().unwrap());
        assert_eq!(got, expected);
        assert_eq!(msg.subject, "orders.created");
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_headers_round_trip_over_wire() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.subscribe("evt").await.unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "application/json");
    headers.insert("X-Trace", "abc");
    client
        .publish_with_headers("evt", &headers, &b"{}"[..])
        .await
        .unwrap();

    let msg = sub.next_timeout(WAIT).await.unwrap();
    let got = msg.headers.unwrap();
    assert_eq!(got.get("content-type"), Some("application/json"));
    assert_eq!(got.get("X-Trace"), Some("abc"));
    assert_eq!(msg.payload.as_ref(), b"{}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_queue_subscribe_sends_group() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.queue_subscribe("jobs.*", "workers").await.unwrap();
    client.flush(WAIT).await.unwrap();

    let lines = broker.sub_lines(0);
    assert!(
        lines.iter().any(|l| l.starts_with("SUB jobs.* workers ")),
        "expected queue group in SUB line, got {lines:?}"
    );

    client.publish("jobs.build", &b"go"[..]).await.unwrap();
    let msg = sub.next_timeout(WAIT).await.unwrap();
    assert_eq!(msg.subject, "jobs.build");
    assert_eq!(sub.queue_group(), Some("workers"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_consumer_drops_and_notifies_once() {
    let broker = MockBroker::start().await;
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .error_callback(move |e| {
            let _ = err_tx.send(e);
        })
        .connect(broker.url())
        .await
        .unwrap();

    let sub = client.subscribe_with_limits("firehose", 5, 0).await.unwrap();
    for i in 0..10u8 {
        client.publish("firehose", vec![i]).await.unwrap();
    }
    // the PONG arrives after every MSG above was dispatched
    client.flush(WAIT).await.unwrap();

    assert_eq!(sub.pending_msgs(), 5);
    assert_eq!(sub.dropped(), 5);

    let err = tokio::time::timeout(WAIT, err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match err {
        ClientError::SlowConsumer { sid, dropped } => {
            assert_eq!(sid, sub.sid());
            assert!(dropped >= 1);
        }
        other => panic!("expected slow consumer error, got {other}"),
    }
    // one episode, one notification
    assert!(err_rx.try_recv().is_err());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_redelivers() {
    let broker = MockBroker::start().await;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let disc_tx = event_tx.clone();
    let reco_tx = event_tx.clone();
    let client = fast_options()
        .disconnected_callback(move || {
            let _ = disc_tx.send("disconnected");
        })
        .reconnected_callback(move || {
            let _ = reco_tx.send("reconnected");
        })
        .connect(broker.url())
        .await
        .unwrap();

    let mut sub = client.subscribe("tasks.*").await.unwrap();
    client.publish("tasks.a", &b"one"[..]).await.unwrap();
    assert_eq!(sub.next_timeout(WAIT).await.unwrap().payload.as_ref(), b"one");

    broker.kick_connections();
    let event = tokio::time::timeout(WAIT, event_rx.recv()).await.unwrap();
    assert_eq!(event, Some("disconnected"));
    let event = tokio::time::timeout(WAIT, event_rx.recv()).await.unwrap();
    assert_eq!(event, Some("reconnected"));

    // exactly one callback each for the episode
    assert!(event_rx.try_recv().is_err());
    assert_eq!(broker.connections(), 2);
    // the reconnected callback fires once the client has written the replayed
    // SUB; wait for the broker's reader task to parse and log it
    let deadline = std::time::Instant::now() + WAIT;
    while !broker
        .sub_lines(1)
        .iter()
        .any(|l| l.starts_with("SUB tasks.* "))
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        broker
            .sub_lines(1)
            .iter()
            .any(|l| l.starts_with("SUB tasks.* ")),
        "subscription was not replayed on the new connection"
    );

    client.publish("tasks.b", &b"two"[..]).await.unwrap();
    assert_eq!(sub.next_timeout(WAIT).await.unwrap().payload.as_ref(), b"two");
    assert_eq!(client.stats().reconnects, 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_failover_moves_to_next_server_in_pool() {
    let first = MockBroker::start().await;
    let second = MockBroker::start().await;
    let (reco_tx, mut reco_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .reconnected_callback(move || {
            let _ = reco_tx.send(());
        })
        .connect(format!("{},{}", first.url(), second.url()))
        .await
        .unwrap();
    assert_eq!(first.connections(), 1);
    assert_eq!(second.connections(), 0);

    let mut sub = client.subscribe("orders.*").await.unwrap();
    client.flush(WAIT).await.unwrap();

    first.kick_connections();
    tokio::time::timeout(WAIT, reco_rx.recv()).await.unwrap();

    // the pool rotated straight to the second server; the first is not
    // retried until a full pass fails
    assert_eq!(first.connections(), 1);
    assert_eq!(second.connections(), 1);
    // the reconnected callback fires once the client has written the replayed
    // SUB; wait for the broker's reader task to parse and log it
    let deadline = std::time::Instant::now() + WAIT;
    while !second
        .sub_lines(0)
        .iter()
        .any(|l| l.starts_with("SUB orders.* "))
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        second
            .sub_lines(0)
            .iter()
            .any(|l| l.starts_with("SUB orders.* ")),
        "subscription was not replayed on the standby server"
    );

    client.publish("orders.new", &b"x"[..]).await.unwrap();
    assert_eq!(sub.next_timeout(WAIT).await.unwrap().payload.as_ref(), b"x");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_publishes_buffered_while_reconnecting() {
    let broker = MockBroker::start().await;
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let (reco_tx, mut reco_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .disconnected_callback(move || {
            let _ = disc_tx.send(());
        })
        .reconnected_callback(move || {
            let _ = reco_tx.send(());
        })
        .connect(broker.url())
        .await
        .unwrap();

    let mut sub = client.subscribe("queued").await.unwrap();
    client.flush(WAIT).await.unwrap();

    broker.kick_connections();
    tokio::time::timeout(WAIT, disc_rx.recv()).await.unwrap();
    assert_eq!(client.status(), Status::Reconnecting);

    // accepted into the pending buffer, not written anywhere yet
    client.publish("queued", &b"held"[..]).await.unwrap();

    tokio::time::timeout(WAIT, reco_rx.recv()).await.unwrap();
    let msg = sub.next_timeout(WAIT).await.unwrap();
    assert_eq!(msg.payload.as_ref(), b"held");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_buffer_capacity_rejects_publish() {
    let broker = MockBroker::start().await;
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .reconnect_buffer_size(64)
        .reconnect_wait(Duration::from_secs(30))
        .disconnected_callback(move || {
            let _ = disc_tx.send(());
        })
        .connect(broker.url())
        .await
        .unwrap();

    broker.kick_connections();
    tokio::time::timeout(WAIT, disc_rx.recv()).await.unwrap();

    // first small publish fits, an oversized one is rejected synchronously
    client.publish("b", &b"x"[..]).await.unwrap();
    let err = client.publish("b", vec![0u8; 128]).await.unwrap_err();
    assert!(matches!(err, ClientError::BufferCapacity(_)), "got {err}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_request_reply() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let responder = client.clone();
    let _svc = client
        .subscribe_with_handler("svc.echo", move |msg| {
            let responder = responder.clone();
            async move {
                if let Some(reply) = msg.reply {
                    responder.publish(&reply, msg.payload).await.unwrap();
                }
            }
        })
        .await
        .unwrap();
    client.flush(WAIT).await.unwrap();

    let reply = client
        .request("svc.echo", &b"ping"[..], WAIT)
        .await
        .unwrap();
    assert_eq!(reply.payload.as_ref(), b"ping");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_request_no_responders_distinct_from_timeout() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let err = client
        .request("nobody.home", &b"?"[..], WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoResponders), "got {err}");

    // a matching subscription that never answers times out instead
    let _sub = client.subscribe("svc.slow").await.unwrap();
    client.flush(WAIT).await.unwrap();
    let err = client
        .request("svc.slow", &b"?"[..], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout), "got {err}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_after_limits_delivery() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.subscribe("tick").await.unwrap();
    sub.unsubscribe_after(3).await.unwrap();
    for i in 0..5u8 {
        client.publish("tick", vec![i]).await.unwrap();
    }
    client.flush(WAIT).await.unwrap();

    for expected in 0..3u8 {
        let msg = sub.next_timeout(WAIT).await.unwrap();
        assert_eq!(msg.payload.as_ref(), &[expected]);
    }
    let err = sub.next_timeout(WAIT).await.unwrap_err();
    assert!(matches!(err, ClientError::SubscriptionClosed), "got {err}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_drain_delivers_queued_then_closes() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _sub = client
        .subscribe_with_handler("drain.x", move |msg| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(msg.payload);
            }
        })
        .await
        .unwrap();

    for i in 0..5u8 {
        client.publish("drain.x", vec![i]).await.unwrap();
    }
    client.flush(WAIT).await.unwrap();

    client.drain(WAIT).await.unwrap();
    assert_eq!(client.status(), Status::Closed);

    // every queued message reached the handler, in order
    for expected in 0..5u8 {
        let payload = tokio::time::timeout(WAIT, seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.as_ref(), &[expected]);
    }

    let err = client.publish("drain.x", &b"late"[..]).await.unwrap_err();
    assert!(matches!(err, ClientError::Closed), "got {err}");
}

#[tokio::test]
async fn test_close_wakes_blocked_next() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.subscribe("silent").await.unwrap();
    let waiter = tokio::spawn(async move { sub.next().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await.unwrap();
    // close is idempotent
    client.close().await.unwrap();

    let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::SubscriptionClosed)));

    let err = client.publish("silent", &b"x"[..]).await.unwrap_err();
    assert!(matches!(err, ClientError::Closed));
}

#[tokio::test]
async fn test_closed_callback_fires_once() {
    let broker = MockBroker::start().await;
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    let client = fast_options()
        .closed_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect(broker.url())
        .await
        .unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initial_connect_failure_without_retry() {
    // nothing listens on the discard port
    let result = fast_options().connect("nats://127.0.0.1:9").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_discovered_servers_callback() {
    let broker =
        MockBroker::start_with_gossip(vec!["10.0.0.7:4222".to_string()]).await;
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .discovered_servers_callback(move |urls| {
            let _ = disc_tx.send(urls);
        })
        .connect(broker.url())
        .await
        .unwrap();

    let urls = tokio::time::timeout(WAIT, disc_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(urls, vec!["10.0.0.7:4222".to_string()]);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_max_payload_enforced() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let err = client
        .publish("big", vec![0u8; 2 * 1024 * 1024])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::MaxPayload { .. }), "got {err}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_subscription_stop_waits_for_worker() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let sub = client
        .subscribe_with_handler("work", move |msg| {
            let seen_tx = seen_tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = seen_tx.send(msg.payload);
            }
        })
        .await
        .unwrap();

    for i in 0..3u8 {
        client.publish("work", vec![i]).await.unwrap();
    }
    client.flush(WAIT).await.unwrap();
    sub.stop().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(payload) = seen_rx.try_recv() {
        seen.push(payload);
    }
    assert_eq!(seen.len(), 3);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_handler_sees_sentinel_then_rearms() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _sub = client
        .subscribe_with_idle_handler("heartbeat", Duration::from_millis(100), move |msg| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(msg.map(|m| m.payload));
            }
        })
        .await
        .unwrap();
    client.flush(WAIT).await.unwrap();

    // no traffic: the idle window elapses and the handler sees `None`
    let first = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_none());

    // a real message lands, skipping any idle firings still queued ahead
    client.publish("heartbeat", &b"beat"[..]).await.unwrap();
    let got = loop {
        let item = tokio::time::timeout(WAIT, seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let Some(payload) = item {
            break payload;
        }
    };
    assert_eq!(got.as_ref(), b"beat");

    // the window re-arms after the message
    let after = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(after.is_none());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_flushes_do_not_mark_connection_stale() {
    // broker answers only the handshake PING, then goes silent
    let broker = MockBroker::start_with_pong_limit(1).await;
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .ping_interval(Duration::from_millis(200))
        .max_pings_out(5)
        .disconnected_callback(move || {
            let _ = disc_tx.send(());
        })
        .connect(broker.url())
        .await
        .unwrap();

    // several flushes in flight at once, none of them ever answered
    let mut waiters = Vec::new();
    for _ in 0..6 {
        let flusher = client.clone();
        waiters.push(tokio::spawn(async move {
            flusher.flush(Duration::from_millis(100)).await
        }));
    }
    for waiter in waiters {
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Timeout)), "got {result:?}");
    }

    // only timer-driven pings count toward staleness, so the connection
    // survives the keepalive ticks that follow
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.status(), Status::Connected);
    assert!(disc_rx.try_recv().is_err());
    assert_eq!(broker.connections(), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_delivery_pool_preserves_per_subscription_order() {
    let broker = MockBroker::start().await;
    let client = fast_options()
        .delivery_pool_size(2)
        .connect(broker.url())
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _sub = client
        .subscribe_with_handler("pooled", move |msg| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(msg.payload[0]);
            }
        })
        .await
        .unwrap();

    for i in 0..20u8 {
        client.publish("pooled", vec![i]).await.unwrap();
    }
    client.flush(WAIT).await.unwrap();

    for expected in 0..20u8 {
        let got = tokio::time::timeout(WAIT, seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, expected);
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stats_counters() {
    let broker = MockBroker::start().await;
    let client = connect_client(&broker).await;

    let mut sub = client.subscribe("s").await.unwrap();
    client.publish("s", &b"12345"[..]).await.unwrap();
    sub.next_timeout(WAIT).await.unwrap();

    let stats = client.stats();
    assert_eq!(stats.out_msgs, 1);
    assert_eq!(stats.in_msgs, 1);
    assert_eq!(stats.out_bytes, 5);
    assert!(stats.in_bytes > 0);
    assert_eq!(stats.reconnects, 0);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_on_failed_connect_establishes_later() {
    // reserve an address, then release it so the first attempts fail
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let client = fast_options()
        .retry_on_failed_connect(true)
        .connected_callback(move || {
            let _ = conn_tx.send(());
        })
        .connect(format!("nats://{addr}"))
        .await
        .unwrap();
    assert_ne!(client.status(), Status::Connected);

    // now a broker appears on that address
    let listener = TcpListener::bind(addr).await.unwrap();
    let (kick, _) = broadcast::channel(1);
    let shared = Arc::new(BrokerShared {
        sub_log: Mutex::new(Vec::new()),
        connections: AtomicUsize::new(0),
        kick,
        connect_urls: Vec::new(),
        pong_limit: None,
    });
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let conn_id = shared.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_connection(stream, Arc::clone(&shared), conn_id));
        }
    });

    tokio::time::timeout(WAIT, conn_rx.recv()).await.unwrap();
    assert_eq!(client.status(), Status::Connected);
    client.close().await.unwrap();
}
