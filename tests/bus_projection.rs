//! End-to-end coverage of the path from a bus event to both the in-memory
//! stores and the SQLite projection, without a live transport or protobuf
//! codec: events are published directly onto the bus the way the radio
//! service and codec would.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use meshdesk::bus::{
    Bus, Channel, ConnectionState, ConnectionStatus, Event, MessageStatus as BusMessageStatus, MessageStatusUpdate,
    NodeUpdate, NodeUpdateKind, Topic, TracerouteStatus, TracerouteUpdate,
};
use meshdesk::persistence::{PersistenceProjection, Repository, WriterQueue};
use meshdesk::store::{ChatMessage, ChatStore, Direction, MessageStatus, Node, NodeStore};
use meshdesk::validation::{channel_chat_key, dm_chat_key};

/// Give the writer queue's single consumer task a moment to apply a command.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

struct Harness {
    bus: Bus,
    node_store: Arc<NodeStore>,
    chat_store: Arc<ChatStore>,
    repository: Arc<Repository>,
    cancel: CancellationToken,
}

impl Harness {
    async fn new() -> Self {
        let bus = Bus::new();
        let cancel = CancellationToken::new();

        let (node_store, _node_changes) = NodeStore::new();
        let (chat_store, _chat_changes) = ChatStore::new();
        let node_store = Arc::new(node_store);
        let chat_store = Arc::new(chat_store);
        node_store.clone().start(bus.clone(), cancel.clone());
        chat_store.clone().start(bus.clone(), cancel.clone());

        let repository = Arc::new(Repository::open_in_memory().unwrap());
        let writer_queue = WriterQueue::start(repository.clone(), cancel.clone());
        PersistenceProjection::new(writer_queue).start(bus.clone(), cancel.clone());

        Self { bus, node_store, chat_store, repository, cancel }
    }

    async fn close(self) {
        self.cancel.cancel();
    }
}

fn node(id: &str, node_num: u32) -> Node {
    Node {
        node_id: id.into(),
        node_num,
        ..Default::default()
    }
}

#[tokio::test]
async fn node_info_event_reaches_store_and_database() {
    let h = Harness::new().await;

    h.bus
        .publish(
            Topic::NodeInfo,
            Event::NodeInfo(NodeUpdate {
                kind: NodeUpdateKind::NodeInfoPacket,
                node: Node {
                    long_name: "Basecamp".into(),
                    battery_level: Some(91),
                    last_heard_at: 1000,
                    ..node("!0000002a", 0x2a)
                },
            }),
        )
        .await;
    settle().await;

    let stored = h.node_store.get("!0000002a").await.unwrap();
    assert_eq!(stored.long_name, "Basecamp");
    assert_eq!(stored.battery_level, Some(91));
    assert_eq!(h.repository.node_count().unwrap(), 1);

    let bootstrap = h.repository.load_bootstrap().unwrap();
    let persisted = bootstrap.nodes.into_iter().find(|n| n.node_id == "!0000002a").unwrap();
    assert_eq!(persisted.long_name, "Basecamp");
    assert_eq!(persisted.battery_level, Some(91));

    h.close().await;
}

#[tokio::test]
async fn channels_event_seeds_channel_chat_with_title_fallback() {
    let h = Harness::new().await;

    h.bus
        .publish(
            Topic::Channels,
            Event::Channels(vec![
                Channel { index: 0, title: "General".into() },
                Channel { index: 1, title: String::new() },
            ]),
        )
        .await;
    settle().await;

    let chats = h.chat_store.chat_list_sorted().await;
    let ch0 = chats.iter().find(|c| c.key == channel_chat_key(0)).unwrap();
    assert_eq!(ch0.title, "General");
    let ch1 = chats.iter().find(|c| c.key == channel_chat_key(1)).unwrap();
    assert_eq!(ch1.title, channel_chat_key(1));

    // A later fallback-titled republish must not clobber the real title.
    h.bus
        .publish(
            Topic::Channels,
            Event::Channels(vec![Channel { index: 0, title: String::new() }]),
        )
        .await;
    settle().await;
    let chats = h.chat_store.chat_list_sorted().await;
    assert_eq!(chats.iter().find(|c| c.key == channel_chat_key(0)).unwrap().title, "General");

    h.close().await;
}

#[tokio::test]
async fn broadcast_message_ack_downgrades_status_consistently_in_store_and_db() {
    let h = Harness::new().await;
    let chat_key = channel_chat_key(0);

    h.bus
        .publish(
            Topic::TextMessage,
            Event::TextMessage(ChatMessage {
                local_id: 0,
                device_message_id: "100".into(),
                chat_key: chat_key.clone(),
                direction: Direction::Out,
                body: "hello mesh".into(),
                status: MessageStatus::Pending,
                status_reason: None,
                at: Utc::now().timestamp_millis(),
                meta_json: None,
            }),
        )
        .await;
    settle().await;

    h.bus
        .publish(
            Topic::MessageStatus,
            Event::MessageStatus(MessageStatusUpdate {
                device_message_id: "100".into(),
                status: BusMessageStatus::Acked,
                reason: None,
                from_node_num: 0,
            }),
        )
        .await;
    settle().await;

    let msgs = h.chat_store.messages(&chat_key).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].status, MessageStatus::Acked);
    assert_eq!(h.repository.find_message_status("100").unwrap(), Some(MessageStatus::Acked));

    // A stale "sent" arriving after "acked" must never regress either copy.
    h.bus
        .publish(
            Topic::MessageStatus,
            Event::MessageStatus(MessageStatusUpdate {
                device_message_id: "100".into(),
                status: BusMessageStatus::Sent,
                reason: None,
                from_node_num: 0,
            }),
        )
        .await;
    settle().await;
    assert_eq!(h.chat_store.messages(&chat_key).await[0].status, MessageStatus::Acked);
    assert_eq!(h.repository.find_message_status("100").unwrap(), Some(MessageStatus::Acked));

    h.close().await;
}

#[tokio::test]
async fn dm_message_failure_records_reason_in_store_and_db() {
    let h = Harness::new().await;
    let chat_key = dm_chat_key(0x42);

    h.bus
        .publish(
            Topic::TextMessage,
            Event::TextMessage(ChatMessage {
                local_id: 0,
                device_message_id: "7".into(),
                chat_key: chat_key.clone(),
                direction: Direction::Out,
                body: "ping".into(),
                status: MessageStatus::Sent,
                status_reason: None,
                at: Utc::now().timestamp_millis(),
                meta_json: None,
            }),
        )
        .await;
    settle().await;

    h.bus
        .publish(
            Topic::MessageStatus,
            Event::MessageStatus(MessageStatusUpdate {
                device_message_id: "7".into(),
                status: BusMessageStatus::Failed,
                reason: Some("no route to destination".into()),
                from_node_num: 0x42,
            }),
        )
        .await;
    settle().await;

    let msgs = h.chat_store.messages(&chat_key).await;
    assert_eq!(msgs[0].status, MessageStatus::Failed);
    assert_eq!(msgs[0].status_reason.as_deref(), Some("no route to destination"));
    assert_eq!(h.repository.find_message_status("7").unwrap(), Some(MessageStatus::Failed));

    h.close().await;
}

#[tokio::test]
async fn traceroute_update_is_projected_to_the_database() {
    let h = Harness::new().await;
    let now = Utc::now();

    h.bus
        .publish(
            Topic::TracerouteUpdate,
            Event::TracerouteUpdate(TracerouteUpdate {
                request_id: 55,
                target_node_id: "!00000042".into(),
                started_at: now,
                updated_at: now,
                completed_at: Some(now),
                status: TracerouteStatus::Completed,
                forward_route: vec![0x10, 0x42],
                forward_snr: vec![4.5, 3.0],
                return_route: vec![0x42, 0x10],
                return_snr: vec![2.5, 4.0],
                error_text: None,
                duration_ms: Some(1200),
            }),
        )
        .await;
    settle().await;

    // Traceroutes aren't part of Bootstrap (spec.md §4.7); this confirms the
    // write queue accepted the command without disturbing the node/chat
    // tables, which is as far as Repository's public surface lets a caller
    // observe a traceroute write.
    let bootstrap = h.repository.load_bootstrap().unwrap();
    assert!(bootstrap.nodes.is_empty());
    assert!(bootstrap.chats.is_empty());

    h.close().await;
}

#[tokio::test]
async fn conn_status_event_is_not_projected_to_persistence_or_stores() {
    let h = Harness::new().await;

    h.bus
        .publish(
            Topic::ConnStatus,
            Event::ConnStatus(ConnectionStatus {
                state: ConnectionState::Connected,
                err: None,
                transport_name: "ip".into(),
                target: "10.0.0.5".into(),
                timestamp: Utc::now(),
            }),
        )
        .await;
    settle().await;

    assert_eq!(h.node_store.len().await, 0);
    assert_eq!(h.repository.node_count().unwrap(), 0);
    assert_eq!(h.repository.chat_count().unwrap(), 0);

    h.close().await;
}

#[tokio::test]
async fn bootstrap_round_trips_nodes_and_messages_through_a_fresh_store_pair() {
    let h = Harness::new().await;
    let chat_key = channel_chat_key(0);

    h.bus
        .publish(
            Topic::NodeInfo,
            Event::NodeInfo(NodeUpdate {
                kind: NodeUpdateKind::NodeInfoPacket,
                node: Node { long_name: "Relay One".into(), last_heard_at: 500, ..node("!00000001", 1) },
            }),
        )
        .await;
    h.bus
        .publish(
            Topic::Channels,
            Event::Channels(vec![Channel { index: 0, title: "General".into() }]),
        )
        .await;
    h.bus
        .publish(
            Topic::TextMessage,
            Event::TextMessage(ChatMessage {
                local_id: 0,
                device_message_id: "9".into(),
                chat_key: chat_key.clone(),
                direction: Direction::In,
                body: "anyone there".into(),
                status: MessageStatus::Acked,
                status_reason: None,
                at: 42,
                meta_json: None,
            }),
        )
        .await;
    settle().await;

    // Simulate a process restart: a fresh store pair loaded only from what
    // the writer queue has flushed to the database by now.
    let (fresh_nodes, _l1) = NodeStore::new();
    let (fresh_chats, _l2) = ChatStore::new();
    let bootstrap = h.repository.load_bootstrap().unwrap();
    fresh_nodes.load_bootstrap(bootstrap.nodes).await;
    fresh_chats.load_bootstrap(bootstrap.chats, bootstrap.messages).await;

    assert_eq!(fresh_nodes.get("!00000001").await.unwrap().long_name, "Relay One");
    let msgs = fresh_chats.messages(&chat_key).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].body, "anyone there");
    assert_eq!(msgs[0].status, MessageStatus::Acked);

    h.close().await;
}
