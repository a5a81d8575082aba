//! # Persistence Projection
//!
//! Mirrors the domain stores to a local SQLite database via a bounded,
//! single-consumer write queue with retry (spec.md §4.7). Subscribes to the
//! same bus topics the stores do; never holds a reference into store-owned
//! state, only event copies.

mod repo;
mod writer;

pub use repo::{Repository, SCHEMA_VERSION};
pub use writer::{WriteCommand, WriterQueue};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Event, Topic};
use crate::store::{Chat, ChatType, Direction, MessageStatus as StoreMessageStatus, Node};

/// Subscribes to the event topics persistence cares about and turns each
/// event into a [`WriteCommand`] on the writer queue.
pub struct PersistenceProjection {
    queue: Arc<WriterQueue>,
}

impl PersistenceProjection {
    pub fn new(queue: Arc<WriterQueue>) -> Self {
        Self { queue }
    }

    pub fn start(self, bus: Bus, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut sub = bus
                .subscribe(&[
                    Topic::NodeInfo,
                    Topic::Channels,
                    Topic::TextMessage,
                    Topic::MessageStatus,
                    Topic::TracerouteUpdate,
                ])
                .await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        let Some(event) = maybe else { break };
                        self.project(event).await;
                    }
                }
            }
        });
    }

    async fn project(&self, event: Event) {
        match event {
            Event::NodeInfo(update) => self.queue.enqueue(WriteCommand::UpsertNode(update.node)).await,
            Event::Channels(channels) => {
                for ch in channels {
                    let key = crate::validation::channel_chat_key(ch.index);
                    let title = if ch.title.is_empty() { key.clone() } else { ch.title };
                    self.queue
                        .enqueue(WriteCommand::UpsertChannelChat(Chat {
                            key,
                            title,
                            chat_type: ChatType::Channel,
                            last_sent_by_me_at: 0,
                            updated_at: 0,
                        }))
                        .await;
                }
            }
            Event::TextMessage(msg) => self.queue.enqueue(WriteCommand::InsertMessage(msg)).await,
            Event::MessageStatus(update) => {
                self.queue
                    .enqueue(WriteCommand::UpdateMessageStatus {
                        device_message_id: update.device_message_id,
                        status: store_status(update.status),
                        reason: update.reason,
                    })
                    .await;
            }
            Event::TracerouteUpdate(update) => self.queue.enqueue(WriteCommand::UpsertTraceroute(update)).await,
            _ => {}
        }
    }
}

fn store_status(s: crate::bus::MessageStatus) -> StoreMessageStatus {
    match s {
        crate::bus::MessageStatus::Pending => StoreMessageStatus::Pending,
        crate::bus::MessageStatus::Sent => StoreMessageStatus::Sent,
        crate::bus::MessageStatus::Acked => StoreMessageStatus::Acked,
        crate::bus::MessageStatus::Failed => StoreMessageStatus::Failed,
    }
}

/// Loaded at startup before the bus begins delivering (spec.md §4.7
/// Bootstrap, §4.10 startup order).
pub struct Bootstrap {
    pub nodes: Vec<Node>,
    pub chats: Vec<Chat>,
    pub messages: std::collections::HashMap<String, Vec<crate::store::ChatMessage>>,
}

pub(crate) fn direction_to_str(d: Direction) -> &'static str {
    match d {
        Direction::In => "in",
        Direction::Out => "out",
    }
}

pub(crate) fn direction_from_str(s: &str) -> Direction {
    if s == "out" {
        Direction::Out
    } else {
        Direction::In
    }
}

pub(crate) fn status_to_str(s: StoreMessageStatus) -> &'static str {
    match s {
        StoreMessageStatus::Pending => "pending",
        StoreMessageStatus::Sent => "sent",
        StoreMessageStatus::Acked => "acked",
        StoreMessageStatus::Failed => "failed",
    }
}

pub(crate) fn status_from_str(s: &str) -> StoreMessageStatus {
    match s {
        "sent" => StoreMessageStatus::Sent,
        "acked" => StoreMessageStatus::Acked,
        "failed" => StoreMessageStatus::Failed,
        _ => StoreMessageStatus::Pending,
    }
}

pub(crate) fn chat_type_to_str(t: ChatType) -> &'static str {
    match t {
        ChatType::Channel => "channel",
        ChatType::Dm => "dm",
    }
}

pub(crate) fn chat_type_from_str(s: &str) -> ChatType {
    if s == "channel" {
        ChatType::Channel
    } else {
        ChatType::Dm
    }
}
