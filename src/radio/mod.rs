//! # Radio Service
//!
//! Owns the switchable transport and the codec; runs the connector
//! supervisor, reader loop, keep-alive loop and outbound worker (spec.md
//! §4.4). This is the layer where ack normalization lives — the main reason
//! it sits above the codec rather than folding into it.

mod ack;

pub use ack::AckTracker;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    Bus, ConnectionState, ConnectionStatus, Event, MessageStatus, Topic,
};
use crate::codec::Codec;
use crate::store::{ChatMessage, Direction};
use crate::transport::SwitchableTransport;

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(15);
const READ_DEADLINE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const KEEPALIVE_WRITE_DEADLINE: Duration = Duration::from_secs(5);
const OUTBOUND_WRITE_DEADLINE: Duration = Duration::from_secs(8);
const WANT_CONFIG_WRITE_DEADLINE: Duration = Duration::from_secs(6);

struct SendRequest {
    chat_key: String,
    text: String,
    reply: oneshot::Sender<anyhow::Result<String>>,
}

/// Owns the connector supervisor loop and the send-request outbox.
pub struct RadioService {
    transport: Arc<SwitchableTransport>,
    codec: Arc<Codec>,
    bus: Bus,
    ack_tracker: Arc<AckTracker>,
    outbox: mpsc::Sender<SendRequest>,
    connected: Arc<std::sync::atomic::AtomicBool>,
}

impl RadioService {
    pub fn new(transport: Arc<SwitchableTransport>, codec: Arc<Codec>, bus: Bus, cancel: CancellationToken) -> Arc<Self> {
        let ack_tracker = Arc::new(AckTracker::new());
        let (outbox_tx, outbox_rx) = mpsc::channel(128);
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let service = Arc::new(Self {
            transport,
            codec,
            bus,
            ack_tracker,
            outbox: outbox_tx,
            connected,
        });

        service.clone().spawn_supervisor(cancel.clone());
        service.clone().spawn_outbound_worker(outbox_rx, cancel);
        service
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hot-swap the underlying transport (spec.md §4.2 `Apply`); the
    /// supervisor loop notices the connection drop and reconnects through
    /// the new transport on its next iteration.
    pub async fn apply_transport(&self, config: crate::transport::ConnectorConfig) -> anyhow::Result<()> {
        self.transport.apply(config).await
    }

    /// Close the transport directly, e.g. during runtime shutdown once the
    /// supervisor has already been cancelled.
    pub async fn close_transport(&self) {
        self.transport.close().await;
    }

    /// Queue a text send; validation happens in [`Codec::encode_text`].
    pub async fn send_text(&self, chat_key: &str, text: &str) -> anyhow::Result<String> {
        let (reply, rx) = oneshot::channel();
        self.outbox
            .send(SendRequest {
                chat_key: chat_key.to_string(),
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("radio service outbox closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("radio service dropped the send request"))?
    }

    /// Synchronous-return admin send: encode, write, publish, return the id.
    pub async fn send_admin(&self, to: u32, channel: u32, want_response: bool, payload: &[u8]) -> anyhow::Result<String> {
        let encoded = self.codec.encode_admin(to, channel, want_response, payload)?;
        timeout(OUTBOUND_WRITE_DEADLINE, self.transport.write_frame(&encoded.bytes)).await??;
        self.publish_raw_out(&encoded.bytes).await;
        Ok(encoded.device_message_id)
    }

    /// Synchronous-return traceroute send: encode, write, publish, return id.
    pub async fn send_traceroute(&self, to: u32, channel: u32) -> anyhow::Result<String> {
        let encoded = self.codec.encode_traceroute(to, channel)?;
        timeout(OUTBOUND_WRITE_DEADLINE, self.transport.write_frame(&encoded.bytes)).await??;
        self.publish_raw_out(&encoded.bytes).await;
        Ok(encoded.device_message_id)
    }

    async fn publish_raw_out(&self, bytes: &[u8]) {
        self.bus
            .publish(Topic::RawFrameOut, Event::RawFrameOut(hex_upper(bytes)))
            .await;
    }

    fn spawn_supervisor(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BACKOFF_MIN;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                self.publish_status(ConnectionState::Connecting, None).await;
                if let Err(e) = self.transport.connect().await {
                    self.publish_status(ConnectionState::Reconnecting, Some(e.to_string())).await;
                    if sleep_or_cancel(backoff, &cancel).await {
                        return;
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    continue;
                }

                self.connected.store(true, Ordering::SeqCst);
                self.publish_status(ConnectionState::Connected, None).await;
                backoff = RECONNECT_BACKOFF_MIN;

                if let Ok((bytes, _id)) = self.codec.encode_want_config() {
                    let _ = timeout(WANT_CONFIG_WRITE_DEADLINE, self.transport.write_frame(&bytes)).await;
                    self.publish_raw_out(&bytes).await;
                }

                let keepalive_cancel = CancellationToken::new();
                let keepalive_handle = self.clone().spawn_keepalive(keepalive_cancel.clone());

                let reader_err = self.reader_loop(&cancel).await;
                keepalive_cancel.cancel();
                let _ = keepalive_handle.await;
                self.transport.close().await;
                self.connected.store(false, Ordering::SeqCst);

                if cancel.is_cancelled() {
                    return;
                }
                let reason = Some(reader_err.unwrap_or_else(|e| e).to_string());
                self.publish_status(ConnectionState::Reconnecting, reason).await;
                if sleep_or_cancel(backoff, &cancel).await {
                    return;
                }
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        });
    }

    async fn publish_status(&self, state: ConnectionState, err: Option<String>) {
        let status = ConnectionStatus {
            state,
            err,
            transport_name: self.transport.name().await.to_string(),
            target: self.transport.status_target().await.unwrap_or_default(),
            timestamp: Utc::now(),
        };
        self.bus.publish(Topic::ConnStatus, Event::ConnStatus(status)).await;
    }

    /// Runs until a read error occurs, then returns it so the supervisor can
    /// reconnect. Keep-alive failures never reach this loop.
    async fn reader_loop(&self, cancel: &CancellationToken) -> anyhow::Result<anyhow::Error> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(anyhow::anyhow!("cancelled")),
                frame = timeout(READ_DEADLINE, self.transport.read_frame()) => {
                    let frame = match frame {
                        Ok(Ok(f)) => f,
                        Ok(Err(e)) => return Ok(e),
                        Err(_) => return Ok(anyhow::anyhow!("read frame deadline exceeded")),
                    };
                    self.bus.publish(Topic::RawFrameIn, Event::RawFrameIn(hex_upper(&frame))).await;

                    let decoded = match self.codec.decode_from_radio(&frame) {
                        Ok(d) => d,
                        Err(e) => {
                            debug!("dropping unparseable frame: {e}");
                            continue;
                        }
                    };

                    self.bus.publish(Topic::RadioFrom, Event::RadioFrom(decoded.frame)).await;
                    if let Some(node_update) = decoded.node_update {
                        self.bus.publish(Topic::NodeInfo, Event::NodeInfo(node_update)).await;
                    }
                    if let Some(discovered) = decoded.node_discovered {
                        self.bus.publish(Topic::NodeDiscovered, Event::NodeDiscovered(discovered)).await;
                    }
                    if let Some(snapshot) = decoded.config_snapshot {
                        self.bus.publish(Topic::ConfigSnapshot, Event::ConfigSnapshot(snapshot.clone())).await;
                        self.bus.publish(Topic::Channels, Event::Channels(snapshot)).await;
                    }
                    if let Some(msg) = decoded.chat_message {
                        self.bus.publish(Topic::TextMessage, Event::TextMessage(msg)).await;
                    }
                    if let Some(admin) = decoded.admin_event {
                        self.bus.publish(Topic::AdminMessage, Event::AdminMessage(admin)).await;
                    }
                    if let Some(tr) = decoded.traceroute_event {
                        self.bus.publish(Topic::Traceroute, Event::Traceroute(tr)).await;
                    }
                    if let Some(update) = decoded.message_status {
                        let normalized = self.ack_tracker.normalize(update);
                        self.bus.publish(Topic::MessageStatus, Event::MessageStatus(normalized)).await;
                    }
                }
            }
        }
    }

    fn spawn_keepalive(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let bytes = match self.codec.encode_heartbeat() {
                            Ok(b) => b,
                            Err(e) => {
                                debug!("heartbeat encode failed: {e}");
                                continue;
                            }
                        };
                        match timeout(KEEPALIVE_WRITE_DEADLINE, self.transport.write_frame(&bytes)).await {
                            Ok(Ok(())) => self.publish_raw_out(&bytes).await,
                            Ok(Err(e)) => debug!("heartbeat write failed: {e}"),
                            Err(_) => debug!("heartbeat write deadline exceeded"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_outbound_worker(self: Arc<Self>, mut outbox_rx: mpsc::Receiver<SendRequest>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe_req = outbox_rx.recv() => {
                        let Some(req) = maybe_req else { return };
                        let result = self.handle_send(&req.chat_key, &req.text).await;
                        let _ = req.reply.send(result);
                    }
                }
            }
        });
    }

    async fn handle_send(&self, chat_key: &str, text: &str) -> anyhow::Result<String> {
        let encoded = self.codec.encode_text(chat_key, text)?;
        timeout(OUTBOUND_WRITE_DEADLINE, self.transport.write_frame(&encoded.bytes)).await??;

        if encoded.want_ack {
            self.ack_tracker.track(encoded.device_message_id.clone(), encoded.target_node_num);
        }

        let status = if encoded.want_ack { MessageStatus::Pending } else { MessageStatus::Sent };
        let out_msg = ChatMessage {
            local_id: 0,
            device_message_id: encoded.device_message_id.clone(),
            chat_key: chat_key.to_string(),
            direction: Direction::Out,
            body: text.to_string(),
            status: status.into(),
            status_reason: None,
            at: Utc::now().timestamp_millis(),
            meta_json: None,
        };
        self.bus.publish(Topic::TextMessage, Event::TextMessage(out_msg)).await;
        self.publish_raw_out(&encoded.bytes).await;

        Ok(encoded.device_message_id)
    }
}

/// Sleeps for `d`, returning early (and reporting cancellation) if the token
/// fires first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = cancel.cancelled() => true,
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        for _ in 0..10 {
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
        assert_eq!(backoff, RECONNECT_BACKOFF_MAX);
    }
}
