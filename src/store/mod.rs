//! # Domain Stores
//!
//! In-memory projections of the mesh: the node store and the chat store.
//! Both subscribe to decoded-event topics on the [`crate::bus::Bus`], merge
//! incoming updates sparsely, and expose read APIs that always return owned
//! copies — callers never see a reference into store-owned state.

mod chat;
mod node;

pub use chat::{should_transition, Chat, ChatMessage, ChatStore, ChatType, Direction, MessageStatus};
pub use node::{Node, NodeStore};

use chrono::{DateTime, Utc};

/// `0` if the value is zero, else `Some(value)` — the shared "is this unset"
/// predicate merge rules are built on. Timestamps use the same rule: zero
/// means unset.
pub(crate) fn is_unset_i64(v: i64) -> bool {
    v == 0
}

pub(crate) fn monotone_timestamp(existing: i64, incoming: i64) -> i64 {
    existing.max(incoming)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Non-blocking change notifier: a bounded broadcast-style signal that a
/// store mutated. Mutators perform a best-effort (drop-if-full) send so that
/// a slow UI listener can never stall a store write.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: tokio::sync::watch::Sender<u64>,
}

pub struct ChangeListener {
    rx: tokio::sync::watch::Receiver<u64>,
}

impl ChangeNotifier {
    pub fn new() -> (Self, ChangeListener) {
        let (tx, rx) = tokio::sync::watch::channel(0);
        (Self { tx }, ChangeListener { rx })
    }

    pub fn notify(&self) {
        let next = *self.tx.borrow() + 1;
        let _ = self.tx.send(next);
    }
}

impl ChangeListener {
    /// Wait for the next change. Resolves immediately if one is already
    /// pending since the last call.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
