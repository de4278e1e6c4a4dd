//! Connection lifecycle
//!
//! One task per client runs [`run`]: select a server, dial, handshake
//! (INFO, optional TLS upgrade, CONNECT, subscription replay), then the
//! steady-state loop feeding the parser until the socket drops. The same
//! task owns liveness pings and the reconnect schedule, so all connection
//! state mutates from a single place.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use wisp_core::proto::{connect_op, sub_op, unsub_op, PING_OP, PONG_OP};
use wisp_core::{Parser, ServerInfo, ServerOp};
use wisp_transport::{
    dial, start_io, upgrade, Socket, SocketReceiver, TcpConfig, TransportEvent,
    TransportReceiver,
};

use crate::auth::build_connect;
use crate::client::{flush_pending, send_command, send_ping, shutdown, unsubscribe_sid, Inner};
use crate::error::{Error, Result};
use crate::message::{Message, Payload};
use crate::options::TlsMode;
use crate::outbound::{ChunkKind, PongSlot};
use crate::servers::ServerAddr;
use crate::Status;

/// Why the steady-state loop ended
enum Exit {
    /// close() was called
    Closed,
    /// Too many unanswered pings or a server-side stale notice; reconnect
    /// silently
    Stale,
    /// Socket dropped
    Io,
    /// Unrecoverable error; the client shuts down
    Fatal(Error),
}

/// Errors while establishing a connection
enum EstablishError {
    /// Configuration or negotiation problem; retrying cannot help
    Fatal(Error),
    /// This endpoint failed; another may work
    Retry(Error),
}

struct Ctx {
    first_tx: Option<oneshot::Sender<Result<()>>>,
    ever_connected: bool,
    attempted: bool,
}

/// Connection task entry point
pub(crate) async fn run(inner: Arc<Inner>, first_tx: oneshot::Sender<Result<()>>) {
    let mut ctx = Ctx {
        first_tx: Some(first_tx),
        ever_connected: false,
        attempted: false,
    };

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let srv = { inner.servers.lock().select_server() };
        let Some(srv) = srv else {
            give_up(&inner, &mut ctx, Some(Error::Conn("no servers available".into())));
            break;
        };
        if ctx.attempted {
            inner.servers.lock().bump_current_reconnects();
        }
        ctx.attempted = true;

        debug!("dialing {}:{}", srv.host, srv.port);
        match establish(&inner, &srv).await {
            Ok((receiver, parser)) => {
                let mut attempt_connected = false;
                let exit =
                    steady_state(&inner, receiver, parser, &mut ctx, &mut attempt_connected).await;

                teardown_connection(&inner);
                inner.set_status(Status::Disconnected);
                if attempt_connected {
                    if let Some(ev) = inner.events() {
                        ev.on_disconnect();
                    }
                }

                match exit {
                    Exit::Closed => break,
                    Exit::Fatal(err) => {
                        give_up(&inner, &mut ctx, Some(err));
                        break;
                    }
                    Exit::Stale | Exit::Io => {}
                }

                if !reconnect_allowed(&inner) {
                    give_up(&inner, &mut ctx, None);
                    break;
                }
                if ctx.ever_connected {
                    inner.set_status(Status::Reconnecting);
                    if let Some(ev) = inner.events() {
                        ev.on_reconnecting();
                    }
                }
                if !wait_before_redial(&inner).await {
                    break;
                }
            }
            Err(EstablishError::Fatal(err)) => {
                if let Some(ev) = inner.events() {
                    ev.on_error(&err);
                }
                give_up(&inner, &mut ctx, Some(err));
                break;
            }
            Err(EstablishError::Retry(err)) => {
                warn!("connect to {}:{} failed: {}", srv.host, srv.port, err);
                // An endpoint that never connected is purged on failure,
                // unless the caller asked to keep waiting on first connect.
                {
                    let mut pool = inner.servers.lock();
                    if !pool.current_did_connect() {
                        if inner.opts.wait_on_first_connect {
                            pool.mark_current_connected();
                        } else {
                            pool.remove_current();
                        }
                    }
                }

                if inner.servers.lock().is_empty() {
                    let err = Error::Conn(format!("unable to connect: {err}"));
                    if let Some(ev) = inner.events() {
                        ev.on_error(&err);
                    }
                    give_up(&inner, &mut ctx, Some(err));
                    break;
                }

                if ctx.ever_connected {
                    if !reconnect_allowed(&inner) {
                        give_up(&inner, &mut ctx, None);
                        break;
                    }
                    inner.set_status(Status::Reconnecting);
                    if let Some(ev) = inner.events() {
                        ev.on_reconnecting();
                    }
                }
                if !wait_before_redial(&inner).await {
                    break;
                }
            }
        }
    }

    debug!("connection task exiting");
}

/// Dial, read INFO, negotiate TLS, send CONNECT and the subscription
/// replay, then hand the socket to the io loop.
async fn establish(
    inner: &Arc<Inner>,
    srv: &ServerAddr,
) -> std::result::Result<(SocketReceiver, Parser), EstablishError> {
    inner.set_status(Status::Dialing);
    let mut tcp = dial(&srv.host, srv.port, &TcpConfig::default())
        .await
        .map_err(|e| EstablishError::Retry(e.into()))?;

    inner.set_status(Status::AwaitingInfo);
    let mut parser = Parser::new();
    let info = read_info(&mut tcp, &mut parser).await?;

    // TLS reconciliation between the server's demands and our options
    let want_tls = inner.opts.tls.is_on() || srv.tls;
    if info.tls_required && !want_tls {
        return Err(EstablishError::Fatal(Error::SecureConnRequired));
    }
    if !info.tls_required && want_tls {
        return Err(EstablishError::Fatal(Error::NonSecureConnRequired));
    }
    let tls_config = match &inner.opts.tls {
        TlsMode::On(config) => Some(config.clone()),
        TlsMode::Off => None,
    };
    if info.tls_verify && !tls_config.as_ref().is_some_and(|c| c.has_client_cert()) {
        return Err(EstablishError::Fatal(Error::ClientCertRequired));
    }

    let mut socket = if want_tls {
        inner.set_status(Status::TlsUpgrade);
        let config = tls_config.unwrap_or_default();
        let tls = upgrade(tcp, &srv.host, &config)
            .await
            .map_err(|e| EstablishError::Fatal(e.into()))?;
        Socket::Tls(Box::new(tls))
    } else {
        Socket::Tcp(tcp)
    };

    // CONNECT plus the full subscription replay go out in one write,
    // ahead of anything sitting in the pending buffer.
    let connect = build_connect(&inner.opts, &info, srv.auth.as_ref())
        .map_err(EstablishError::Fatal)?;
    inner.set_status(Status::Connecting);

    let mut handshake = BytesMut::new();
    handshake.extend_from_slice(&connect_op(&connect).map_err(|e| EstablishError::Fatal(e.into()))?);

    let mut sids: Vec<i64> = inner.subs.iter().map(|e| *e.key()).collect();
    sids.sort_unstable();
    for sid in sids {
        if let Some(sub) = inner.subs.get(&sid) {
            handshake.extend_from_slice(&sub_op(&sub.subject, sub.queue_group.as_deref(), sid));
            if let Some(max) = sub.max {
                let remaining = max.saturating_sub(sub.received);
                if remaining > 0 {
                    handshake.extend_from_slice(&unsub_op(sid, Some(remaining)));
                }
            }
        }
    }

    socket
        .write_all(&handshake)
        .await
        .map_err(|e| EstablishError::Retry(Error::Conn(e.to_string())))?;

    *inner.info.lock() = Some(info.clone());
    let added = inner.servers.lock().process_update(&info.connect_urls);
    if !added.is_empty() {
        if let Some(ev) = inner.events() {
            ev.on_servers_discovered(&added);
            ev.on_servers(&added);
        }
    }

    // SUBs queued while disconnected were just replayed from the registry;
    // drop them from pending, then queue the handshake ping whose pong
    // completes the connect sequence.
    {
        let mut pending = inner.pending.lock();
        pending.strip_subs();
        inner.pongs.lock().push_back(PongSlot::Handshake);
        pending.push(ChunkKind::Ping, Bytes::from_static(PING_OP));
    }

    let (sender, receiver) = start_io(socket);
    *inner.writer.lock() = Some(sender);
    inner.connected.store(true, Ordering::SeqCst);
    inner.pout.store(0, Ordering::SeqCst);
    flush_pending(inner);

    info!("handshake sent to {}:{}", srv.host, srv.port);
    Ok((receiver, parser))
}

/// Read from the raw stream until the first INFO arrives
async fn read_info(
    stream: &mut tokio::net::TcpStream,
    parser: &mut Parser,
) -> std::result::Result<ServerInfo, EstablishError> {
    let mut tmp = BytesMut::with_capacity(4096);
    loop {
        loop {
            match parser.next() {
                Ok(Some(ServerOp::Info(info))) => return Ok(info),
                Ok(Some(op)) => debug!("ignoring pre-handshake op: {:?}", op),
                Ok(None) => break,
                Err(e) => return Err(EstablishError::Fatal(e.into())),
            }
        }
        tmp.clear();
        let n = stream
            .read_buf(&mut tmp)
            .await
            .map_err(|e| EstablishError::Retry(Error::Conn(e.to_string())))?;
        if n == 0 {
            return Err(EstablishError::Retry(Error::Conn(
                "connection closed awaiting info".into(),
            )));
        }
        parser.feed(&tmp);
    }
}

/// Post-handshake loop: feed the parser, answer pings, keep liveness.
async fn steady_state(
    inner: &Arc<Inner>,
    mut receiver: SocketReceiver,
    mut parser: Parser,
    ctx: &mut Ctx,
    attempt_connected: &mut bool,
) -> Exit {
    let ping_interval = inner.opts.ping_interval;
    let mut ping_sleep = Box::pin(tokio::time::sleep(ping_interval));

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return Exit::Closed;
        }
        tokio::select! {
            _ = inner.close_notify.notified() => return Exit::Closed,

            _ = &mut ping_sleep => {
                if let Some(exit) = ping_tick(inner) {
                    return exit;
                }
                ping_sleep.as_mut().reset(tokio::time::Instant::now() + ping_interval);
            }

            ev = receiver.recv() => match ev {
                None => return Exit::Io,
                Some(TransportEvent::Disconnected { reason }) => {
                    debug!("socket disconnected: {:?}", reason);
                    return Exit::Io;
                }
                Some(TransportEvent::Error(e)) => {
                    warn!("socket error: {}", e);
                }
                Some(TransportEvent::Data(data)) => {
                    parser.feed(&data);
                    let started = Instant::now();
                    loop {
                        match parser.next() {
                            Ok(Some(op)) => {
                                if let Some(exit) = handle_op(inner, op, ctx, attempt_connected) {
                                    return exit;
                                }
                                // Cooperative yield: long parse runs hand the
                                // scheduler back between payloads.
                                if let Some(limit) = inner.opts.yield_time {
                                    if started.elapsed() > limit {
                                        tokio::task::yield_now().await;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let err: Error = e.into();
                                if let Some(ev) = inner.events() {
                                    ev.on_error(&err);
                                }
                                return Exit::Fatal(err);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Liveness tick. Returns an exit when the connection has gone stale.
fn ping_tick(inner: &Arc<Inner>) -> Option<Exit> {
    if inner.closed.load(Ordering::SeqCst) {
        return Some(Exit::Closed);
    }
    // Still mid-handshake: reschedule without sending.
    if !matches!(inner.status(), Status::Connected) {
        return None;
    }
    if let Some(ev) = inner.events() {
        ev.on_ping_timer();
    }
    let pout = inner.pout.fetch_add(1, Ordering::SeqCst) + 1;
    if pout > inner.opts.max_ping_out {
        debug!("stale connection after {} unanswered pings", pout - 1);
        return Some(Exit::Stale);
    }
    if let Some(ev) = inner.events() {
        ev.on_ping_count(pout);
    }
    send_ping(inner, PongSlot::Bare);
    None
}

fn handle_op(
    inner: &Arc<Inner>,
    op: ServerOp,
    ctx: &mut Ctx,
    attempt_connected: &mut bool,
) -> Option<Exit> {
    match op {
        ServerOp::Msg {
            subject,
            sid,
            reply,
            payload,
        } => {
            dispatch_msg(inner, subject, sid, reply, payload);
            None
        }
        ServerOp::Ping => {
            send_command(inner, ChunkKind::Pong, Bytes::from_static(PONG_OP));
            None
        }
        ServerOp::Pong => {
            handle_pong(inner, ctx, attempt_connected);
            None
        }
        ServerOp::Ok => None,
        ServerOp::Info(info) => {
            handle_gossip(inner, info);
            None
        }
        ServerOp::Err(text) => handle_server_err(inner, text),
    }
}

/// Subsequent INFO frames are gossip: reconcile the server list, never
/// re-handshake.
fn handle_gossip(inner: &Arc<Inner>, info: ServerInfo) {
    let added = inner.servers.lock().process_update(&info.connect_urls);
    *inner.info.lock() = Some(info);
    if !added.is_empty() {
        if let Some(ev) = inner.events() {
            ev.on_servers_discovered(&added);
            ev.on_servers(&added);
        }
    }
}

fn handle_server_err(inner: &Arc<Inner>, text: String) -> Option<Exit> {
    let lower = text.to_lowercase();
    if lower.contains("stale connection") {
        return Some(Exit::Stale);
    }
    if lower.contains("permissions violation") {
        // The connection stays useful for other subjects.
        let err = Error::Server(text);
        if let Some(ev) = inner.events() {
            ev.on_permission_error(&err);
        }
        return None;
    }
    let err = Error::Server(text);
    if let Some(ev) = inner.events() {
        ev.on_error(&err);
    }
    Some(Exit::Fatal(err))
}

fn handle_pong(inner: &Arc<Inner>, ctx: &mut Ctx, attempt_connected: &mut bool) {
    inner.pout.store(0, Ordering::SeqCst);
    let slot = inner.pongs.lock().pop_front();
    match slot {
        None | Some(PongSlot::Bare) => {}
        Some(PongSlot::Flush(tx)) => {
            let _ = tx.send(());
        }
        Some(PongSlot::Handshake) => {
            inner.set_status(Status::Connected);
            inner.servers.lock().mark_current_connected();
            *attempt_connected = true;
            let was_reconnect = ctx.ever_connected;
            ctx.ever_connected = true;
            if was_reconnect {
                inner.stats.reconnects.fetch_add(1, Ordering::SeqCst);
                info!("reconnected");
                if let Some(ev) = inner.events() {
                    ev.on_reconnect();
                }
            } else {
                info!("connected");
                if let Some(ev) = inner.events() {
                    ev.on_connect();
                }
            }
            if let Some(tx) = ctx.first_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }
}

/// Route one MSG to its subscription, honoring counters and limits.
pub(crate) fn dispatch_msg(
    inner: &Arc<Inner>,
    subject: String,
    sid: i64,
    reply: Option<String>,
    payload: Bytes,
) {
    inner.stats.in_msgs.fetch_add(1, Ordering::Relaxed);
    inner
        .stats
        .in_bytes
        .fetch_add(payload.len() as u64, Ordering::Relaxed);

    // Unknown sid: the server outran an unsubscribe; drop silently.
    let Some(mut entry) = inner.subs.get_mut(&sid) else {
        return;
    };
    entry.received += 1;
    let received = entry.received;
    let disarm = entry.timeout.as_ref().is_some_and(|t| received >= t.expected);
    if disarm {
        if let Some(t) = entry.timeout.take() {
            t.handle.abort();
        }
    }
    let max = entry.max;
    let callback = entry.callback.clone();
    drop(entry);

    let mut deliver = true;
    if let Some(max) = max {
        if received >= max {
            unsubscribe_sid(inner, sid, None);
        }
        if received > max {
            // UNSUB with a limit raced an in-flight delivery.
            deliver = false;
        }
    }

    if !deliver || inner.closed.load(Ordering::SeqCst) {
        return;
    }

    let msg = Message {
        subject,
        sid,
        reply,
        data: Payload::decode(inner.opts.payload, payload),
    };
    invoke_callback(inner, move || callback(msg));
}

/// Run a user callback, turning panics into error events so the parser
/// loop survives.
pub(crate) fn invoke_callback(inner: &Arc<Inner>, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let desc = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "delivery callback panicked".to_string()
        };
        let err = Error::Callback(desc);
        if let Some(ev) = inner.events() {
            ev.on_error(&err);
        }
    }
}

/// Detach the dead socket and rebuild pending/pongs for the next dial
fn teardown_connection(inner: &Arc<Inner>) {
    inner.connected.store(false, Ordering::SeqCst);
    *inner.writer.lock() = None;
    inner.pout.store(0, Ordering::SeqCst);
    let mut pending = inner.pending.lock();
    let mut pongs = inner.pongs.lock();
    pending.rebuild_for_redial(&mut pongs);
}

fn reconnect_allowed(inner: &Inner) -> bool {
    if !inner.opts.reconnect {
        return false;
    }
    let max = inner.opts.max_reconnect_attempts;
    if max < 0 {
        return true;
    }
    i64::from(inner.servers.lock().current_reconnects()) < i64::from(max)
}

/// Cold candidates are retried immediately; ones that connected before get
/// the configured wait. Returns false when the client closed meanwhile.
async fn wait_before_redial(inner: &Inner) -> bool {
    if inner.closed.load(Ordering::SeqCst) {
        return false;
    }
    if !inner.servers.lock().next_did_connect() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(inner.opts.reconnect_time_wait) => true,
        _ = inner.close_notify.notified() => false,
    }
}

/// Terminal path: resolve the connect future, emit close, release state
fn give_up(inner: &Arc<Inner>, ctx: &mut Ctx, err: Option<Error>) {
    if let Some(tx) = ctx.first_tx.take() {
        let _ = tx.send(Err(err.unwrap_or(Error::ConnClosed)));
    }
    if let Some(ev) = inner.events() {
        ev.on_close();
    }
    shutdown(inner);
}
