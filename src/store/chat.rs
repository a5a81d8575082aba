//! Chat store: conversations (broadcast channels and DM threads) plus their
//! ordered message sequences (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bus::{Bus, Event, MessageStatus as BusMessageStatus, Topic};
use crate::validation::{channel_chat_key, parse_chat_key, ChatTarget};

use super::{monotone_timestamp, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Channel,
    Dm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl From<BusMessageStatus> for MessageStatus {
    fn from(s: BusMessageStatus) -> Self {
        match s {
            BusMessageStatus::Pending => MessageStatus::Pending,
            BusMessageStatus::Sent => MessageStatus::Sent,
            BusMessageStatus::Acked => MessageStatus::Acked,
            BusMessageStatus::Failed => MessageStatus::Failed,
        }
    }
}

/// Returns true iff the transition `cur -> next` is allowed (spec.md §4.6).
pub fn should_transition(cur: MessageStatus, next: MessageStatus) -> bool {
    use MessageStatus::*;
    matches!(
        (cur, next),
        (Pending, Sent) | (Pending, Acked) | (Pending, Failed) | (Sent, Acked) | (Sent, Failed) | (Failed, Acked)
    )
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub key: String,
    pub title: String,
    pub chat_type: ChatType,
    pub last_sent_by_me_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub local_id: u64,
    pub device_message_id: String,
    pub chat_key: String,
    pub direction: Direction,
    pub body: String,
    pub status: MessageStatus,
    pub status_reason: Option<String>,
    pub at: i64,
    pub meta_json: Option<String>,
}

/// A fallback title equal to the chat key itself never overwrites a
/// previously-set real title (spec.md §3 Chat invariant, §4.6/§4.7 guard).
fn is_fallback_title(title: &str, key: &str) -> bool {
    title.is_empty() || title == key
}

fn chat_type_of(key: &str) -> ChatType {
    match parse_chat_key(key) {
        Ok(ChatTarget::Channel(_)) => ChatType::Channel,
        _ => ChatType::Dm,
    }
}

struct Inner {
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<ChatMessage>>,
    next_local_id: u64,
}

/// Owns the chats map and the per-chat ordered message sequences.
pub struct ChatStore {
    inner: Arc<RwLock<Inner>>,
    notifier: super::ChangeNotifier,
}

impl ChatStore {
    pub fn new() -> (Self, super::ChangeListener) {
        let (notifier, listener) = super::ChangeNotifier::new();
        (
            Self {
                inner: Arc::new(RwLock::new(Inner {
                    chats: HashMap::new(),
                    messages: HashMap::new(),
                    next_local_id: 1,
                })),
                notifier,
            },
            listener,
        )
    }

    /// Merge a chat: `last_sent_by_me_at` and `updated_at` are monotone; a
    /// missing `updated_at` defaults to now. A fallback title never
    /// overwrites a previously-set real title.
    pub async fn upsert_chat(&self, incoming: Chat) {
        let mut inner = self.inner.write().await;
        match inner.chats.get_mut(&incoming.key) {
            Some(existing) => {
                if !is_fallback_title(&incoming.title, &incoming.key)
                    || is_fallback_title(&existing.title, &existing.key)
                {
                    if !incoming.title.is_empty() {
                        existing.title = incoming.title;
                    }
                }
                existing.last_sent_by_me_at =
                    monotone_timestamp(existing.last_sent_by_me_at, incoming.last_sent_by_me_at);
                existing.updated_at = if incoming.updated_at == 0 {
                    now_ms().max(existing.updated_at)
                } else {
                    monotone_timestamp(existing.updated_at, incoming.updated_at)
                };
            }
            None => {
                let mut c = incoming;
                if c.updated_at == 0 {
                    c.updated_at = now_ms();
                }
                inner.chats.insert(c.key.clone(), c);
            }
        }
        drop(inner);
        self.notifier.notify();
    }

    /// Append or merge a message, deduped by (chat_key, device_message_id)
    /// when the id is non-empty (spec.md §4.6).
    pub async fn append_message(&self, mut msg: ChatMessage) {
        let mut inner = self.inner.write().await;

        if !inner.chats.contains_key(&msg.chat_key) {
            let chat_type = chat_type_of(&msg.chat_key);
            inner.chats.insert(
                msg.chat_key.clone(),
                Chat {
                    key: msg.chat_key.clone(),
                    title: msg.chat_key.clone(),
                    chat_type,
                    last_sent_by_me_at: 0,
                    updated_at: 0,
                },
            );
        }

        let bucket = inner.messages.entry(msg.chat_key.clone()).or_default();
        let existing_idx = if msg.device_message_id.is_empty() {
            None
        } else {
            bucket
                .iter()
                .position(|m| m.device_message_id == msg.device_message_id)
        };

        if let Some(idx) = existing_idx {
            let existing = &mut bucket[idx];
            if existing.body.is_empty() {
                existing.body = msg.body.clone();
            }
            if existing.meta_json.is_none() {
                existing.meta_json = msg.meta_json.clone();
            }
            existing.at = existing.at.max(msg.at);
            if should_transition(existing.status, msg.status) {
                existing.status = msg.status;
                existing.status_reason = if msg.status == MessageStatus::Failed {
                    msg.status_reason.clone()
                } else {
                    None
                };
            }
        } else {
            msg.local_id = inner.next_local_id;
            inner.next_local_id += 1;
            let direction = msg.direction;
            let at = msg.at;
            let chat_key = msg.chat_key.clone();
            inner.messages.entry(chat_key.clone()).or_default().push(msg);
            if let Some(chat) = inner.chats.get_mut(&chat_key) {
                if direction == Direction::Out {
                    chat.last_sent_by_me_at = at;
                }
                chat.updated_at = at;
            }
        }
        drop(inner);
        self.notifier.notify();
    }

    /// Apply a status update across all chats for the given device message id
    /// (spec.md §4.6 `UpdateMessageStatusByDeviceID`).
    pub async fn update_message_status_by_device_id(
        &self,
        device_message_id: &str,
        status: MessageStatus,
        reason: Option<String>,
    ) {
        if device_message_id.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        for bucket in inner.messages.values_mut() {
            for m in bucket.iter_mut() {
                if m.device_message_id != device_message_id {
                    continue;
                }
                if m.status == MessageStatus::Failed && status == MessageStatus::Failed {
                    m.status_reason = reason.clone();
                    continue;
                }
                if should_transition(m.status, status) {
                    m.status = status;
                    m.status_reason = if status == MessageStatus::Failed {
                        reason.clone()
                    } else {
                        None
                    };
                }
            }
        }
        drop(inner);
        self.notifier.notify();
    }

    /// Sorted by `last_sent_by_me_at` desc, tiebreak `updated_at` desc.
    pub async fn chat_list_sorted(&self) -> Vec<Chat> {
        let inner = self.inner.read().await;
        let mut chats: Vec<Chat> = inner.chats.values().cloned().collect();
        chats.sort_by(|a, b| {
            b.last_sent_by_me_at
                .cmp(&a.last_sent_by_me_at)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        chats
    }

    /// Messages in a chat, sorted by `at` ascending.
    pub async fn messages(&self, chat_key: &str) -> Vec<ChatMessage> {
        let inner = self.inner.read().await;
        let mut msgs = inner.messages.get(chat_key).cloned().unwrap_or_default();
        msgs.sort_by_key(|m| m.at);
        msgs
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.chats.clear();
        inner.messages.clear();
        drop(inner);
        self.notifier.notify();
    }

    pub async fn load_bootstrap(&self, chats: Vec<Chat>, messages: HashMap<String, Vec<ChatMessage>>) {
        let mut inner = self.inner.write().await;
        let max_id = messages
            .values()
            .flatten()
            .map(|m| m.local_id)
            .max()
            .unwrap_or(0);
        inner.next_local_id = inner.next_local_id.max(max_id + 1);
        for chat in chats {
            inner.chats.insert(chat.key.clone(), chat);
        }
        for (key, msgs) in messages {
            inner.messages.insert(key, msgs);
        }
    }

    /// Wire `text.message` -> append, `message.status` -> status update,
    /// `channels` -> upsert a channel chat per entry (spec.md §4.6 `Start`).
    pub fn start(self: Arc<Self>, bus: Bus, cancel: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            let mut sub = bus
                .subscribe(&[Topic::TextMessage, Topic::MessageStatus, Topic::Channels])
                .await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        match maybe {
                            Some(Event::TextMessage(msg)) => self.append_message(msg).await,
                            Some(Event::MessageStatus(update)) => {
                                self.update_message_status_by_device_id(
                                    &update.device_message_id,
                                    update.status.into(),
                                    update.reason,
                                )
                                .await;
                            }
                            Some(Event::Channels(channels)) => {
                                for ch in channels {
                                    let key = channel_chat_key(ch.index);
                                    let title = if ch.title.is_empty() { key.clone() } else { ch.title };
                                    self.upsert_chat(Chat {
                                        key,
                                        title,
                                        chat_type: ChatType::Channel,
                                        last_sent_by_me_at: 0,
                                        updated_at: 0,
                                    })
                                    .await;
                                }
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(chat_key: &str, device_id: &str, status: MessageStatus, at: i64) -> ChatMessage {
        ChatMessage {
            local_id: 0,
            device_message_id: device_id.to_string(),
            chat_key: chat_key.to_string(),
            direction: Direction::Out,
            body: "hi".into(),
            status,
            status_reason: None,
            at,
            meta_json: None,
        }
    }

    #[tokio::test]
    async fn dedup_by_chat_key_and_device_id() {
        let (store, _l) = ChatStore::new();
        store
            .append_message(msg("channel:0", "42", MessageStatus::Pending, 10))
            .await;
        store
            .append_message(msg("channel:0", "42", MessageStatus::Sent, 20))
            .await;
        let msgs = store.messages("channel:0").await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, MessageStatus::Sent);
        assert_eq!(msgs[0].at, 20);
    }

    #[tokio::test]
    async fn status_regression_is_rejected() {
        let (store, _l) = ChatStore::new();
        store
            .append_message(msg("channel:0", "1", MessageStatus::Acked, 1))
            .await;
        store
            .update_message_status_by_device_id("1", MessageStatus::Sent, None)
            .await;
        let msgs = store.messages("channel:0").await;
        assert_eq!(msgs[0].status, MessageStatus::Acked);
    }

    #[tokio::test]
    async fn failed_to_acked_is_allowed() {
        let (store, _l) = ChatStore::new();
        store
            .append_message(msg("channel:0", "9", MessageStatus::Failed, 1))
            .await;
        store
            .update_message_status_by_device_id("9", MessageStatus::Acked, None)
            .await;
        assert_eq!(store.messages("channel:0").await[0].status, MessageStatus::Acked);
    }

    #[tokio::test]
    async fn fallback_title_never_overwrites_real_title() {
        let (store, _l) = ChatStore::new();
        store
            .upsert_chat(Chat {
                key: "channel:1".into(),
                title: "General".into(),
                chat_type: ChatType::Channel,
                last_sent_by_me_at: 0,
                updated_at: 0,
            })
            .await;
        store
            .upsert_chat(Chat {
                key: "channel:1".into(),
                title: "channel:1".into(),
                chat_type: ChatType::Channel,
                last_sent_by_me_at: 0,
                updated_at: 0,
            })
            .await;
        let chats = store.chat_list_sorted().await;
        assert_eq!(chats[0].title, "General");
    }

    #[tokio::test]
    async fn outbound_message_advances_last_sent_by_me() {
        let (store, _l) = ChatStore::new();
        store
            .append_message(msg("dm:!1", "1", MessageStatus::Sent, 100))
            .await;
        let chats = store.chat_list_sorted().await;
        assert_eq!(chats[0].last_sent_by_me_at, 100);
    }
}
