//! Request/reply multiplexer
//!
//! A naive request would create one subscription per call. Instead the
//! client subscribes once to `<root>.*` and hands out per-request tokens as
//! the final subject segment; replies are routed token -> callback here.
//! Cancellation never touches the shared wildcard subscription.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::client::Inner;
use crate::conn::invoke_callback;
use crate::error::{Error, Result};
use crate::message::Message;

/// Callback for a request: a reply, or a timeout error
pub(crate) type RequestCallback = Arc<dyn Fn(Result<Message>) + Send + Sync>;

/// One outstanding request
pub(crate) struct MuxRequest {
    pub id: i64,
    pub callback: RequestCallback,
    pub received: u64,
    /// Replies after which the request completes
    pub expected: Option<u64>,
    pub timer: Option<AbortHandle>,
}

/// The shared mux state, created lazily on the first request
pub(crate) struct MuxRoot {
    /// Root inbox; the wildcard subscription covers `<inbox>.*`
    pub inbox: String,
    /// Length of `<inbox>.`, for token extraction
    pub prefix_len: usize,
    /// Sid of the wildcard subscription
    pub sid: i64,
    /// Next request id, decreasing from -1
    pub next_id: i64,
    pub requests: HashMap<String, MuxRequest>,
    pub by_id: HashMap<i64, String>,
}

impl MuxRoot {
    pub fn new(inbox: String, sid: i64) -> Self {
        let prefix_len = inbox.len() + 1;
        Self {
            inbox,
            prefix_len,
            sid,
            next_id: -1,
            requests: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Register a request and return its id
    pub fn add(&mut self, token: String, callback: RequestCallback, expected: Option<u64>) -> i64 {
        let id = self.next_id;
        self.next_id -= 1;
        self.requests.insert(
            token.clone(),
            MuxRequest {
                id,
                callback,
                received: 0,
                expected,
                timer: None,
            },
        );
        self.by_id.insert(id, token);
        id
    }

    /// Remove a request by token, aborting its timer
    pub fn remove_by_token(&mut self, token: &str) -> Option<MuxRequest> {
        let req = self.requests.remove(token)?;
        self.by_id.remove(&req.id);
        if let Some(timer) = &req.timer {
            timer.abort();
        }
        Some(req)
    }

    /// Remove a request by its negative id
    pub fn remove_by_id(&mut self, id: i64) -> Option<MuxRequest> {
        let token = self.by_id.remove(&id)?;
        let req = self.requests.remove(&token)?;
        if let Some(timer) = &req.timer {
            timer.abort();
        }
        Some(req)
    }
}

/// Deliver a message arriving on the wildcard subscription.
///
/// The token is the subject segment after the root inbox; unknown tokens
/// are dropped silently (late replies after cancel or timeout).
pub(crate) fn dispatch(inner: &Arc<Inner>, msg: Message) {
    if inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
        return;
    }
    let callback = {
        let mut mux = inner.mux.lock();
        let Some(root) = mux.as_mut() else { return };
        if msg.sid != root.sid || msg.subject.len() <= root.prefix_len {
            return;
        }
        let token = msg.subject[root.prefix_len..].to_string();
        let Some(req) = root.requests.get_mut(&token) else {
            return;
        };
        req.received += 1;
        let callback = req.callback.clone();
        let done = req.expected.is_some_and(|e| req.received >= e);
        if done {
            root.remove_by_token(&token);
        }
        callback
    };
    invoke_callback(inner, move || callback(Ok(msg)));
}

/// Fire a request timeout: cancel the request and deliver the error
pub(crate) fn fire_timeout(inner: &Arc<Inner>, token: &str) {
    if inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
        return;
    }
    let callback = {
        let mut mux = inner.mux.lock();
        let Some(root) = mux.as_mut() else { return };
        match root.remove_by_token(token) {
            Some(req) => req.callback,
            None => return,
        }
    };
    invoke_callback(inner, move || callback(Err(Error::RequestTimeout)));
}
