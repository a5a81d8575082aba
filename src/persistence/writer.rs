//! Bounded, single-consumer write queue with retry (spec.md §4.7).
//!
//! Mirrors the teacher's file-locking discipline around the storage layer:
//! all writes are serialized through one task so there is never a need for a
//! cross-task lock around the SQLite connection itself.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::TracerouteUpdate;
use crate::store::{Chat, ChatMessage, MessageStatus, Node};

use super::Repository;

pub const QUEUE_CAPACITY: usize = 512;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub enum WriteCommand {
    UpsertNode(Node),
    UpsertChannelChat(Chat),
    InsertMessage(ChatMessage),
    UpdateMessageStatus {
        device_message_id: String,
        status: MessageStatus,
        reason: Option<String>,
    },
    UpsertTraceroute(TracerouteUpdate),
}

/// Bounded write queue. `enqueue` never blocks the caller: if the channel is
/// full, the send itself is pushed into a background task.
pub struct WriterQueue {
    tx: mpsc::Sender<WriteCommand>,
}

impl WriterQueue {
    /// Spawns the single consumer task and returns the queue handle.
    pub fn start(repo: Arc<Repository>, cancel: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = rx.recv() => {
                        let Some(cmd) = maybe else { break };
                        run_with_retry(&repo, cmd).await;
                    }
                }
            }
        });

        Arc::new(Self { tx })
    }

    pub async fn enqueue(&self, cmd: WriteCommand) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(cmd).await.is_err() {
                        error!("writer queue closed while enqueuing under backpressure");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("writer queue closed, dropping write command");
            }
        }
    }
}

async fn run_with_retry(repo: &Repository, cmd: WriteCommand) {
    for attempt in 1..=MAX_ATTEMPTS {
        let result = apply(repo, &cmd);
        match result {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!("write command failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                error!("write command abandoned after {MAX_ATTEMPTS} attempts: {e}");
            }
        }
    }
}

fn apply(repo: &Repository, cmd: &WriteCommand) -> anyhow::Result<()> {
    match cmd {
        WriteCommand::UpsertNode(node) => repo.upsert_node(node),
        WriteCommand::UpsertChannelChat(chat) => repo.upsert_channel_chat(chat),
        WriteCommand::InsertMessage(msg) => repo.insert_message(msg),
        WriteCommand::UpdateMessageStatus { device_message_id, status, reason } => {
            repo.update_message_status(device_message_id, *status, reason.as_deref())
        }
        WriteCommand::UpsertTraceroute(update) => repo.upsert_traceroute(update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Node;

    #[tokio::test]
    async fn enqueue_under_capacity_does_not_panic() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let queue = WriterQueue::start(repo, cancel.clone());
        queue
            .enqueue(WriteCommand::UpsertNode(Node {
                node_id: "!1".into(),
                ..Default::default()
            }))
            .await;
        cancel.cancel();
    }
}
