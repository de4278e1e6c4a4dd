//! Subscription registry types
//!
//! The registry itself is a `DashMap<i64, Subscription>` owned by the
//! client; sids are positive and strictly increasing. Mux request ids share
//! the signed space on the negative side, so the two never collide.

use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::message::Message;

/// Delivery callback for a subscription
pub(crate) type SubCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// An armed subscription timeout
pub(crate) struct SubTimeout {
    /// Deliveries that disarm the timer
    pub expected: u64,
    pub handle: AbortHandle,
}

/// One client-side subscription
pub(crate) struct Subscription {
    pub subject: String,
    pub queue_group: Option<String>,
    pub callback: SubCallback,
    pub received: u64,
    /// Auto-unsubscribe after this many deliveries
    pub max: Option<u64>,
    pub timeout: Option<SubTimeout>,
}

/// Options for subscribe
#[derive(Debug, Clone, Default)]
pub struct SubOptions {
    pub queue_group: Option<String>,
    /// Auto-unsubscribe after this many deliveries
    pub max: Option<u64>,
}
