//! The client
//!
//! Shared state lives in [`Inner`]; one connection task (see `conn`) owns
//! the socket and all lifecycle transitions. Public API calls enqueue
//! commands into the pending buffer and return without touching the
//! network, so everything here is callable from any task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use wisp_core::proto::{pub_op, sub_op, unsub_op, PING_OP};
use wisp_core::{is_valid_subject, new_inbox, nuid, ServerInfo};
use wisp_transport::{SocketSender, TransportSender};

use crate::conn;
use crate::error::{Error, Result};
use crate::events::ClientEvents;
use crate::message::Message;
use crate::mux::{MuxRoot, RequestCallback};
use crate::options::Options;
use crate::outbound::{ChunkKind, Outbound, PongSlot, FLUSH_THRESHOLD};
use crate::servers::ServerPool;
use crate::subs::{SubCallback, SubOptions, SubTimeout, Subscription};
use crate::ClientBuilder;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Dialing,
    AwaitingInfo,
    TlsUpgrade,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub in_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_msgs: AtomicU64,
    pub out_bytes: AtomicU64,
    pub reconnects: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> Stats {
        Stats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Options for a request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Complete after this many replies
    pub max: Option<u64>,
    /// Deliver a timeout error and cancel if no reply arrives in time
    pub timeout: Option<Duration>,
}

/// State shared between the client handle and its connection task
pub(crate) struct Inner {
    pub opts: Options,
    pub status: Mutex<Status>,
    /// Socket established; flushes reach the wire
    pub connected: AtomicBool,
    pub closed: AtomicBool,
    pub close_notify: Notify,
    pub servers: Mutex<ServerPool>,
    pub subs: DashMap<i64, Subscription>,
    pub next_sid: AtomicI64,
    pub mux: Mutex<Option<MuxRoot>>,
    pub pending: Mutex<Outbound>,
    pub pongs: Mutex<VecDeque<PongSlot>>,
    pub pout: AtomicU32,
    pub info: Mutex<Option<ServerInfo>>,
    pub writer: Mutex<Option<SocketSender>>,
    pub stats: StatsCounters,
}

impl Inner {
    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Event sink, silenced once the client is closed
    pub fn events(&self) -> Option<&Arc<dyn ClientEvents>> {
        if self.closed.load(Ordering::SeqCst) {
            None
        } else {
            Some(&self.opts.events)
        }
    }
}

/// Append a command to the pending buffer and arrange a flush.
///
/// The first chunk after an empty buffer schedules an asynchronous flush on
/// the next scheduler tick; crossing the threshold flushes immediately.
/// While disconnected the chunk just waits; the handshake drains it.
pub(crate) fn send_command(inner: &Arc<Inner>, kind: ChunkKind, bytes: Bytes) {
    let flush_now = {
        let mut pending = inner.pending.lock();
        enqueue_locked(inner, &mut pending, kind, bytes)
    };
    if flush_now {
        flush_pending(inner);
    }
}

/// Enqueue a PING with its pong-queue slot. The two are paired under one
/// lock so slots and pings can never interleave out of order.
pub(crate) fn send_ping(inner: &Arc<Inner>, slot: PongSlot) {
    let flush_now = {
        let mut pending = inner.pending.lock();
        inner.pongs.lock().push_back(slot);
        enqueue_locked(inner, &mut pending, ChunkKind::Ping, Bytes::from_static(PING_OP))
    };
    if flush_now {
        flush_pending(inner);
    }
}

fn enqueue_locked(
    inner: &Arc<Inner>,
    pending: &mut Outbound,
    kind: ChunkKind,
    bytes: Bytes,
) -> bool {
    pending.push(kind, bytes);
    if !inner.connected.load(Ordering::SeqCst) {
        return false;
    }
    if pending.size() > FLUSH_THRESHOLD {
        return true;
    }
    if !pending.flush_scheduled {
        pending.flush_scheduled = true;
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if let Some(inner) = weak.upgrade() {
                flush_pending(&inner);
            }
        });
    }
    false
}

/// Coalesce and hand the pending buffer to the socket writer
pub(crate) fn flush_pending(inner: &Arc<Inner>) {
    let mut pending = inner.pending.lock();
    pending.flush_scheduled = false;
    if pending.is_empty() {
        return;
    }
    let writer = inner.writer.lock();
    let Some(w) = writer.as_ref() else {
        return;
    };
    let chunks = pending.take_all();
    let buf = Outbound::coalesce(&chunks);
    let n = buf.len() as u64;
    if w.send(buf).is_ok() {
        inner.stats.out_bytes.fetch_add(n, Ordering::Relaxed);
    } else {
        // The socket died under us; keep the commands for the redial
        // rebuild. The lock is held, so order is preserved exactly.
        for chunk in chunks {
            pending.push(chunk.kind, chunk.bytes);
        }
    }
}

/// Send UNSUB and drop or limit the subscription
pub(crate) fn unsubscribe_sid(inner: &Arc<Inner>, sid: i64, max: Option<u64>) {
    if !inner.subs.contains_key(&sid) {
        return;
    }
    send_command(inner, ChunkKind::Unsub, unsub_op(sid, max));

    let mut remove = false;
    let mut subject = String::new();
    if let Some(mut entry) = inner.subs.get_mut(&sid) {
        match max {
            None => remove = true,
            Some(m) if entry.received >= m => remove = true,
            Some(m) => entry.max = Some(m),
        }
        if remove {
            subject = entry.subject.clone();
            if let Some(t) = &entry.timeout {
                t.handle.abort();
            }
        }
    }
    if remove {
        inner.subs.remove(&sid);
        if let Some(ev) = inner.events() {
            ev.on_unsubscribe(sid, &subject);
        }
    }
}

/// Release all client state. Idempotent; used by close() and by the
/// connection task when it gives up.
pub(crate) fn shutdown(inner: &Arc<Inner>) {
    inner.closed.store(true, Ordering::SeqCst);
    inner.set_status(Status::Closed);
    inner.close_notify.notify_waiters();
    inner.connected.store(false, Ordering::SeqCst);

    for entry in inner.subs.iter() {
        if let Some(t) = &entry.timeout {
            t.handle.abort();
        }
    }
    inner.subs.clear();

    if let Some(root) = inner.mux.lock().take() {
        for (_, req) in root.requests {
            if let Some(timer) = &req.timer {
                timer.abort();
            }
        }
    }

    inner.pending.lock().clear();
    inner.pongs.lock().clear();
    *inner.writer.lock() = None;
}

/// A wisp client.
///
/// All methods enqueue and return; nothing blocks on the network except the
/// explicitly awaiting calls (`flush`, `request_one`). The client must live
/// inside a tokio runtime.
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Builder entry point
    pub fn builder(url: &str) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Connect to a single server with default options
    pub async fn connect(url: &str) -> Result<Client> {
        ClientBuilder::new(url).connect().await
    }

    /// Connect with resolved options
    pub async fn connect_with(opts: Options) -> Result<Client> {
        let pool = ServerPool::new(&opts.servers, opts.url.as_deref(), opts.no_randomize)?;
        if pool.is_empty() {
            return Err(Error::BadOptions("no servers configured".into()));
        }

        let inner = Arc::new(Inner {
            opts,
            status: Mutex::new(Status::Disconnected),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            servers: Mutex::new(pool),
            subs: DashMap::new(),
            next_sid: AtomicI64::new(1),
            mux: Mutex::new(None),
            pending: Mutex::new(Outbound::new()),
            pongs: Mutex::new(VecDeque::new()),
            pout: AtomicU32::new(0),
            info: Mutex::new(None),
            writer: Mutex::new(None),
            stats: StatsCounters::default(),
        });

        let (tx, rx) = oneshot::channel();
        tokio::spawn(conn::run(inner.clone(), tx));

        match rx.await {
            Ok(Ok(())) => Ok(Client { inner }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Conn("connection task exited".into())),
        }
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Publish a payload to a subject
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.do_publish(subject, None, payload.as_ref())
    }

    /// Publish with a reply subject
    pub fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.do_publish(subject, Some(reply), payload.as_ref())
    }

    /// Serialize a value as JSON and publish it
    pub fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|e| Error::BadJson(e.to_string()))?;
        self.do_publish(subject, None, &payload)
    }

    fn do_publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        if !is_valid_subject(subject) {
            return Err(Error::BadSubject);
        }
        if let Some(reply) = reply {
            if !is_valid_subject(reply) {
                return Err(Error::BadReply);
            }
        }
        if let Some(info) = inner.info.lock().as_ref() {
            if info.max_payload > 0 && payload.len() as u64 > info.max_payload {
                return Err(Error::BadMsg(format!(
                    "payload of {} bytes exceeds server limit of {}",
                    payload.len(),
                    info.max_payload
                )));
            }
        }
        send_command(inner, ChunkKind::Pub, pub_op(subject, reply, payload));
        inner.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscribe
    // ------------------------------------------------------------------

    /// Subscribe to a subject
    pub fn subscribe<F>(&self, subject: &str, callback: F) -> Result<i64>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(subject, SubOptions::default(), callback)
    }

    /// Subscribe as part of a queue group
    pub fn queue_subscribe<F>(&self, subject: &str, queue_group: &str, callback: F) -> Result<i64>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(
            subject,
            SubOptions {
                queue_group: Some(queue_group.to_string()),
                max: None,
            },
            callback,
        )
    }

    /// Subscribe with explicit options
    pub fn subscribe_with<F>(&self, subject: &str, opts: SubOptions, callback: F) -> Result<i64>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        if !is_valid_subject(subject) {
            return Err(Error::BadSubject);
        }
        if let Some(group) = &opts.queue_group {
            if !is_valid_subject(group) {
                return Err(Error::BadSubject);
            }
        }

        let sid = inner.next_sid.fetch_add(1, Ordering::SeqCst);
        inner.subs.insert(
            sid,
            Subscription {
                subject: subject.to_string(),
                queue_group: opts.queue_group.clone(),
                callback: Arc::new(callback),
                received: 0,
                max: None,
                timeout: None,
            },
        );
        send_command(
            inner,
            ChunkKind::Sub,
            sub_op(subject, opts.queue_group.as_deref(), sid),
        );
        if let Some(ev) = inner.events() {
            ev.on_subscribe(sid, subject, opts.queue_group.as_deref());
        }
        if let Some(max) = opts.max {
            unsubscribe_sid(inner, sid, Some(max));
        }
        Ok(sid)
    }

    /// Remove a subscription, or cancel a mux request (negative id)
    pub fn unsubscribe(&self, id: i64) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        if id < 0 {
            self.cancel_request(id);
            return Ok(());
        }
        unsubscribe_sid(&self.inner, id, None);
        Ok(())
    }

    /// Let the subscription lapse after `max` total deliveries
    pub fn auto_unsubscribe(&self, sid: i64, max: u64) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        unsubscribe_sid(&self.inner, sid, Some(max));
        Ok(())
    }

    /// Arm a timeout on a subscription: if fewer than `expected` messages
    /// arrive before `wait` elapses, `callback` runs once and the
    /// subscription is dropped.
    pub fn sub_timeout<F>(&self, sid: i64, wait: Duration, expected: u64, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }

        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let fire = match inner.subs.get_mut(&sid) {
                Some(mut entry) => {
                    if entry.received < expected {
                        entry.timeout = None;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if fire {
                callback();
                unsubscribe_sid(&inner, sid, None);
            }
        })
        .abort_handle();

        match inner.subs.get_mut(&sid) {
            Some(mut entry) => {
                if let Some(old) = entry.timeout.replace(SubTimeout { expected, handle }) {
                    old.handle.abort();
                }
                Ok(())
            }
            None => {
                handle.abort();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Request / reply
    // ------------------------------------------------------------------

    /// Issue a request over the shared mux inbox. Returns a negative id
    /// usable with [`Client::unsubscribe`] to cancel.
    pub fn request<F>(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        opts: RequestOptions,
        callback: F,
    ) -> Result<i64>
    where
        F: Fn(Result<Message>) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        if !is_valid_subject(subject) {
            return Err(Error::BadSubject);
        }
        if inner.opts.use_old_request_style {
            return self.request_old(subject, payload.as_ref(), opts, Arc::new(callback));
        }

        let root_inbox = ensure_mux(inner)?;
        let token = nuid::next();
        let reply_inbox = format!("{root_inbox}.{token}");

        let id = {
            let mut mux = inner.mux.lock();
            let root = mux.as_mut().expect("mux initialized");
            root.add(token.clone(), Arc::new(callback), opts.max)
        };

        if let Some(timeout) = opts.timeout {
            let weak = Arc::downgrade(inner);
            let timer_token = token.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    crate::mux::fire_timeout(&inner, &timer_token);
                }
            })
            .abort_handle();
            let mut mux = inner.mux.lock();
            if let Some(root) = mux.as_mut() {
                if let Some(req) = root.requests.get_mut(&token) {
                    req.timer = Some(handle);
                } else {
                    handle.abort();
                }
            }
        }

        self.do_publish(subject, Some(&reply_inbox), payload.as_ref())?;
        Ok(id)
    }

    /// Legacy path: a dedicated subscription per request
    fn request_old(
        &self,
        subject: &str,
        payload: &[u8],
        opts: RequestOptions,
        callback: RequestCallback,
    ) -> Result<i64> {
        let inbox = new_inbox();
        let max = opts.max.unwrap_or(1);

        let deliver = callback.clone();
        let sid = self.subscribe_with(
            &inbox,
            SubOptions {
                queue_group: None,
                max: Some(max),
            },
            move |msg| deliver(Ok(msg)),
        )?;

        if let Some(timeout) = opts.timeout {
            let on_timeout = callback.clone();
            self.sub_timeout(sid, timeout, max, move || {
                on_timeout(Err(Error::RequestTimeout))
            })?;
        }

        self.do_publish(subject, Some(&inbox), payload)?;
        Ok(sid)
    }

    /// One request, one reply, as a future
    pub async fn request_one(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        self.request(
            subject,
            payload,
            RequestOptions {
                max: Some(1),
                timeout: Some(timeout),
            },
            move |res| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(res);
                }
            },
        )?;
        rx.await.map_err(|_| Error::ConnClosed)?
    }

    /// A request expecting several replies, delivered on a channel
    pub fn request_many(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        expected: u64,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<Result<Message>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(
            subject,
            payload,
            RequestOptions {
                max: Some(expected),
                timeout: Some(timeout),
            },
            move |res| {
                let _ = tx.send(res);
            },
        )?;
        Ok(rx)
    }

    fn cancel_request(&self, id: i64) {
        let mut mux = self.inner.mux.lock();
        if let Some(root) = mux.as_mut() {
            root.remove_by_id(id);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Round-trip to the server: resolves once a PONG answers the PING
    /// queued behind everything sent so far.
    pub async fn flush(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }
        let (tx, rx) = oneshot::channel();
        send_ping(&self.inner, PongSlot::Flush(tx));
        rx.await
            .map_err(|_| Error::Conn("connection lost before flush completed".into()))
    }

    /// [`Client::flush`] with an upper bound on the wait
    pub async fn flush_timeout(&self, wait: Duration) -> Result<()> {
        match tokio::time::timeout(wait, self.flush()).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    /// Close the client. Idempotent and immediate: timers die, the socket
    /// drops, and no callbacks or events fire afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("client closed");
        shutdown(&self.inner);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        matches!(self.inner.status(), Status::Connected)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Last INFO received from the current server
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.info.lock().clone()
    }

    /// Number of live subscriptions, the mux wildcard included
    pub fn num_subscriptions(&self) -> usize {
        self.inner.subs.len()
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create the shared mux subscription if it does not exist yet
fn ensure_mux(inner: &Arc<Inner>) -> Result<String> {
    {
        let mux = inner.mux.lock();
        if let Some(root) = mux.as_ref() {
            return Ok(root.inbox.clone());
        }
    }

    let mut mux = inner.mux.lock();
    if let Some(root) = mux.as_ref() {
        return Ok(root.inbox.clone());
    }

    let inbox = new_inbox();
    let wildcard = format!("{inbox}.*");
    let sid = inner.next_sid.fetch_add(1, Ordering::SeqCst);

    let weak = Arc::downgrade(inner);
    let callback: SubCallback = Arc::new(move |msg| {
        if let Some(inner) = weak.upgrade() {
            crate::mux::dispatch(&inner, msg);
        }
    });

    inner.subs.insert(
        sid,
        Subscription {
            subject: wildcard.clone(),
            queue_group: None,
            callback,
            received: 0,
            max: None,
            timeout: None,
        },
    );
    send_command(inner, ChunkKind::Sub, sub_op(&wildcard, None, sid));
    if let Some(ev) = inner.events() {
        ev.on_subscribe(sid, &wildcard, None);
    }

    *mux = Some(MuxRoot::new(inbox.clone(), sid));
    Ok(inbox)
}
