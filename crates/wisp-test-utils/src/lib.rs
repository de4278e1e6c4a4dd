//! Common test helpers and utilities for wisp tests
//!
//! This crate provides:
//! - An in-process [`TestServer`] speaking the wire protocol, routing
//!   messages between connected clients
//! - Condition-based waiting (no hardcoded sleeps)
//! - Message collectors for subscription testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F>(check: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        tokio::time::sleep(DEFAULT_CHECK_INTERVAL).await;
    }
    false
}

// ============================================================================
// Message Collector
// ============================================================================

/// Collects (subject, payload-as-text) pairs from subscription callbacks
#[derive(Clone, Default)]
pub struct MessageCollector {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, subject: &str, payload: &str) {
        self.messages.lock().push((subject.to_string(), payload.to_string()));
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    pub async fn wait_for_count(&self, target: usize, max_wait: Duration) -> bool {
        wait_for(|| self.count() >= target, max_wait).await
    }
}

// ============================================================================
// Test Server
// ============================================================================

/// Server-side view of one subscription
struct SubEntry {
    conn_id: u64,
    sid: i64,
    subject: String,
    queue_group: Option<String>,
    max: Option<u64>,
    received: u64,
}

/// Behaviour knobs for the test server
#[derive(Default)]
pub struct TestServerConfig {
    /// Nonce advertised in INFO; clients must sign it
    pub nonce: Option<String>,
    /// Validates the CONNECT json; rejecting sends an authorization error
    #[allow(clippy::type_complexity)]
    pub auth_check: Option<Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>>,
    /// Advertised max_payload (0 = leave unset)
    pub max_payload: u64,
    /// Extra `connect_urls` gossiped in the initial INFO
    pub connect_urls: Vec<String>,
}

struct ServerState {
    subs: Mutex<Vec<SubEntry>>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>,
    next_conn: AtomicU64,
    /// When set, PINGs from clients go unanswered
    ignore_pings: AtomicBool,
    /// When set, inbound bytes stay buffered and unprocessed
    pause_reads: AtomicBool,
    /// When set, new connections are rejected immediately
    refuse_connections: AtomicBool,
    connects: Mutex<Vec<serde_json::Value>>,
    config: TestServerConfig,
}

/// An in-process server for tests. Routes PUB to matching subscriptions
/// across every connection; cleans up on drop.
pub struct TestServer {
    port: u16,
    state: Arc<ServerState>,
    accept_handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_config(TestServerConfig::default()).await
    }

    pub async fn start_with_config(config: TestServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let state = Arc::new(ServerState {
            subs: Mutex::new(Vec::new()),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            ignore_pings: AtomicBool::new(false),
            pause_reads: AtomicBool::new(false),
            refuse_connections: AtomicBool::new(false),
            connects: Mutex::new(Vec::new()),
            config,
        });

        let accept_state = state.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                if accept_state.refuse_connections.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                debug!("test server accepted {}", peer);
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    run_connection(conn_state, stream).await;
                });
            }
        });

        Self {
            port,
            state,
            accept_handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port)
    }

    /// Number of live server-side subscriptions
    pub fn num_subscriptions(&self) -> usize {
        self.state.subs.lock().len()
    }

    /// CONNECT payloads received so far
    pub fn connects(&self) -> Vec<serde_json::Value> {
        self.state.connects.lock().clone()
    }

    /// SUB subjects seen for the currently live connections
    pub fn subscribed_subjects(&self) -> Vec<String> {
        self.state
            .subs
            .lock()
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    /// Stop answering client PINGs (drives stale-connection detection)
    pub fn set_ignore_pings(&self, ignore: bool) {
        self.state.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Stop processing inbound bytes; they pile up and are handled on
    /// resume, like a server whose reads are blocked
    pub fn set_pause_reads(&self, pause: bool) {
        self.state.pause_reads.store(pause, Ordering::SeqCst);
    }

    /// Refuse new connections without closing the listener
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Drop every client connection (clients see a socket close)
    pub fn kill_connections(&self) {
        self.state.conns.lock().clear();
        self.state.subs.lock().clear();
    }

    /// Push a raw protocol line to every client
    pub fn broadcast_raw(&self, line: &str) {
        let data = Bytes::from(format!("{line}\r\n"));
        for tx in self.state.conns.lock().values() {
            let _ = tx.send(data.clone());
        }
    }

    pub fn shutdown(&self) {
        self.accept_handle.abort();
        self.kill_connections();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Token-wise subject match supporting `*` and `>`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let sub: Vec<&str> = subject.split('.').collect();
    for (i, token) in pat.iter().enumerate() {
        if *token == ">" {
            return i < sub.len();
        }
        if i >= sub.len() {
            return false;
        }
        if *token != "*" && *token != sub[i] {
            return false;
        }
    }
    pat.len() == sub.len()
}

async fn run_connection(state: Arc<ServerState>, mut stream: TcpStream) {
    let conn_id = state.next_conn.fetch_add(1, Ordering::SeqCst);

    let mut info = String::from("{\"server_id\":\"wisp-test\"");
    if state.config.max_payload > 0 {
        info.push_str(&format!(",\"max_payload\":{}", state.config.max_payload));
    }
    if let Some(nonce) = &state.config.nonce {
        info.push_str(&format!(",\"nonce\":\"{nonce}\""));
    }
    if !state.config.connect_urls.is_empty() {
        let urls: Vec<String> = state
            .config
            .connect_urls
            .iter()
            .map(|u| format!("\"{u}\""))
            .collect();
        info.push_str(&format!(",\"connect_urls\":[{}]", urls.join(",")));
    }
    info.push('}');

    if stream
        .write_all(format!("INFO {info}\r\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    state.conns.lock().insert(conn_id, out_tx);

    let (mut reader, mut writer) = stream.into_split();
    // Drains queued output after the connection entry is dropped, so a
    // final -ERR still reaches the client before the socket closes.
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(8 * 1024);
    'outer: loop {
        while state.pause_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Drain complete commands already buffered.
        loop {
            let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
                break;
            };
            let line = String::from_utf8_lossy(&buf[..line_end]).to_string();
            buf.advance(line_end + 2);

            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("CONNECT") => {
                    let json = line["CONNECT".len()..].trim();
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
                        let ok = state
                            .config
                            .auth_check
                            .as_ref()
                            .map(|check| check(&value))
                            .unwrap_or(true);
                        state.connects.lock().push(value);
                        if !ok {
                            send_to(&state, conn_id, "-ERR 'Authorization Violation'\r\n");
                            break 'outer;
                        }
                    }
                }
                Some("PING") => {
                    if !state.ignore_pings.load(Ordering::SeqCst) {
                        send_to(&state, conn_id, "PONG\r\n");
                    }
                }
                Some("PONG") => {}
                Some("SUB") => {
                    let args: Vec<&str> = parts.collect();
                    let (subject, queue_group, sid) = match args.as_slice() {
                        [subject, sid] => (*subject, None, *sid),
                        [subject, group, sid] => (*subject, Some(group.to_string()), *sid),
                        _ => continue,
                    };
                    if let Ok(sid) = sid.parse::<i64>() {
                        state.subs.lock().push(SubEntry {
                            conn_id,
                            sid,
                            subject: subject.to_string(),
                            queue_group,
                            max: None,
                            received: 0,
                        });
                    }
                }
                Some("UNSUB") => {
                    let args: Vec<&str> = parts.collect();
                    let Some(Ok(sid)) = args.first().map(|s| s.parse::<i64>()) else {
                        continue;
                    };
                    let max = args.get(1).and_then(|s| s.parse::<u64>().ok());
                    let mut subs = state.subs.lock();
                    match max {
                        None => subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid)),
                        Some(max) => {
                            let mut drop_now = false;
                            if let Some(entry) = subs
                                .iter_mut()
                                .find(|s| s.conn_id == conn_id && s.sid == sid)
                            {
                                if entry.received >= max {
                                    drop_now = true;
                                } else {
                                    entry.max = Some(max);
                                }
                            }
                            if drop_now {
                                subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid));
                            }
                        }
                    }
                }
                Some("PUB") => {
                    let args: Vec<&str> = parts.collect();
                    let (subject, reply, size) = match args.as_slice() {
                        [subject, size] => (subject.to_string(), None, *size),
                        [subject, reply, size] => {
                            (subject.to_string(), Some(reply.to_string()), *size)
                        }
                        _ => continue,
                    };
                    let Ok(size) = size.parse::<usize>() else {
                        continue;
                    };
                    // Wait for the whole payload plus CRLF.
                    while buf.len() < size + 2 {
                        let n = match reader.read_buf(&mut buf).await {
                            Ok(n) => n,
                            Err(_) => break 'outer,
                        };
                        if n == 0 {
                            break 'outer;
                        }
                    }
                    let payload = buf.split_to(size).freeze();
                    buf.advance(2);
                    route_pub(&state, &subject, reply.as_deref(), &payload);
                }
                _ => {}
            }
        }

        let n = match reader.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
    }

    state.conns.lock().remove(&conn_id);
    state.subs.lock().retain(|s| s.conn_id != conn_id);
}

fn send_to(state: &ServerState, conn_id: u64, data: &str) {
    if let Some(tx) = state.conns.lock().get(&conn_id) {
        let _ = tx.send(Bytes::from(data.to_string()));
    }
}

/// Deliver a publish to matching subscriptions, one per queue group
fn route_pub(state: &ServerState, subject: &str, reply: Option<&str>, payload: &[u8]) {
    let mut subs = state.subs.lock();
    let mut delivered_groups: Vec<String> = Vec::new();
    let mut expired: Vec<(u64, i64)> = Vec::new();

    for entry in subs.iter_mut() {
        if !subject_matches(&entry.subject, subject) {
            continue;
        }
        if let Some(group) = &entry.queue_group {
            if delivered_groups.contains(group) {
                continue;
            }
            delivered_groups.push(group.clone());
        }

        entry.received += 1;
        let mut msg = format!("MSG {} {} ", subject, entry.sid);
        if let Some(reply) = reply {
            msg.push_str(reply);
            msg.push(' ');
        }
        msg.push_str(&payload.len().to_string());
        msg.push_str("\r\n");

        let mut frame = BytesMut::with_capacity(msg.len() + payload.len() + 2);
        frame.extend_from_slice(msg.as_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");

        if let Some(tx) = state.conns.lock().get(&entry.conn_id) {
            let _ = tx.send(frame.freeze());
        }

        if entry.max.is_some_and(|m| entry.received >= m) {
            expired.push((entry.conn_id, entry.sid));
        }
    }

    subs.retain(|s| !expired.contains(&(s.conn_id, s.sid)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("foo", "foo"));
        assert!(!subject_matches("foo", "bar"));
        assert!(subject_matches("foo.*", "foo.bar"));
        assert!(!subject_matches("foo.*", "foo.bar.baz"));
        assert!(subject_matches("foo.>", "foo.bar.baz"));
        assert!(!subject_matches("foo.>", "foo"));
        assert!(subject_matches("_INBOX.abc.*", "_INBOX.abc.tok1"));
        assert!(!subject_matches("_INBOX.abc.*", "_INBOX.other.tok1"));
    }
}
