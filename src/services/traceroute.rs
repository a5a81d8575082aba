//! Traceroute service: cooldown-guarded request/response tracking over the
//! bus (spec.md §4.9).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    Bus, ConnectionState, Event, Topic, TracerouteEvent, TracerouteStatus, TracerouteUpdate,
};
use crate::radio::RadioService;
use crate::store::NodeStore;
use crate::validation::format_node_id;

const COOLDOWN: Duration = Duration::from_secs(30);
const PENDING_TIMEOUT: Duration = Duration::from_secs(60);

struct Pending {
    target_node_id: String,
    started_at: chrono::DateTime<Utc>,
}

struct Inner {
    pending: HashMap<u32, Pending>,
    last_start: Option<std::time::Instant>,
}

/// Errors `StartTraceroute` can raise (spec.md §4.9 step 1-2).
#[derive(Debug, thiserror::Error)]
pub enum TracerouteError {
    #[error("not connected")]
    NotConnected,
    #[error("cooldown: {remaining_secs} s remaining")]
    Cooldown { remaining_secs: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Tracks in-flight traceroutes, their cooldown window, and the 60 s
/// per-request timeout watcher.
pub struct TracerouteService {
    bus: Bus,
    radio: Arc<RadioService>,
    node_store: Arc<NodeStore>,
    inner: Mutex<Inner>,
}

impl TracerouteService {
    pub fn new(bus: Bus, radio: Arc<RadioService>, node_store: Arc<NodeStore>, cancel: CancellationToken) -> Arc<Self> {
        let service = Arc::new(Self {
            bus,
            radio,
            node_store,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                last_start: None,
            }),
        });
        service.clone().spawn_event_handler(cancel);
        service
    }

    pub async fn start(self: &Arc<Self>, target: u32) -> Result<u32, TracerouteError> {
        if !self.radio.is_connected() {
            return Err(TracerouteError::NotConnected);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(last) = inner.last_start {
                let elapsed = last.elapsed();
                if elapsed < COOLDOWN {
                    return Err(TracerouteError::Cooldown {
                        remaining_secs: (COOLDOWN - elapsed).as_secs(),
                    });
                }
            }
            inner.last_start = Some(std::time::Instant::now());
        }

        let channel = self
            .node_store
            .get(&format_node_id(target))
            .await
            .and_then(|n| n.channel)
            .unwrap_or(0);

        let device_message_id = self.radio.send_traceroute(target, channel).await?;
        let request_id: u32 = device_message_id.parse().unwrap_or(0);
        let started_at = Utc::now();

        self.inner.lock().unwrap().pending.insert(
            request_id,
            Pending {
                target_node_id: format_node_id(target),
                started_at,
            },
        );

        self.publish_update(TracerouteUpdate {
            request_id,
            target_node_id: format_node_id(target),
            started_at,
            updated_at: started_at,
            completed_at: None,
            status: TracerouteStatus::Started,
            forward_route: vec![],
            forward_snr: vec![],
            return_route: vec![],
            return_snr: vec![],
            error_text: None,
            duration_ms: None,
        })
        .await;

        self.clone().spawn_timeout_watcher(request_id);
        Ok(request_id)
    }

    async fn publish_update(&self, update: TracerouteUpdate) {
        self.bus.publish(Topic::TracerouteUpdate, Event::TracerouteUpdate(update)).await;
    }

    fn spawn_timeout_watcher(self: Arc<Self>, request_id: u32) {
        tokio::spawn(async move {
            tokio::time::sleep(PENDING_TIMEOUT).await;
            let evicted = self.inner.lock().unwrap().pending.remove(&request_id);
            if let Some(pending) = evicted {
                self.publish_update(TracerouteUpdate {
                    request_id,
                    target_node_id: pending.target_node_id,
                    started_at: pending.started_at,
                    updated_at: Utc::now(),
                    completed_at: None,
                    status: TracerouteStatus::TimedOut,
                    forward_route: vec![],
                    forward_snr: vec![],
                    return_route: vec![],
                    return_snr: vec![],
                    error_text: Some("timed out waiting for a response".into()),
                    duration_ms: None,
                })
                .await;
            }
        });
    }

    fn spawn_event_handler(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut sub = self
                .bus
                .subscribe(&[Topic::Traceroute, Topic::MessageStatus, Topic::ConnStatus])
                .await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        match maybe {
                            Some(Event::Traceroute(ev)) => self.handle_traceroute_event(ev).await,
                            Some(Event::MessageStatus(update)) => self.handle_status_failed(update).await,
                            Some(Event::ConnStatus(status)) if status.state != ConnectionState::Connected => {
                                self.evict_all(format!("connection changed to {:?}", status.state)).await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_traceroute_event(&self, ev: TracerouteEvent) {
        let (started_at, target_node_id) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(pending) = inner.pending.get(&ev.request_id) else { return };
            let snapshot = (pending.started_at, pending.target_node_id.clone());
            if ev.is_complete {
                inner.pending.remove(&ev.request_id);
            }
            snapshot
        };
        let now = Utc::now();

        self.publish_update(TracerouteUpdate {
            request_id: ev.request_id,
            target_node_id,
            started_at,
            updated_at: now,
            completed_at: if ev.is_complete { Some(now) } else { None },
            status: if ev.is_complete {
                TracerouteStatus::Completed
            } else {
                TracerouteStatus::Progress
            },
            forward_route: ev.forward_route,
            forward_snr: ev.forward_snr,
            return_route: ev.return_route,
            return_snr: ev.return_snr,
            error_text: None,
            duration_ms: if ev.is_complete {
                Some((now - started_at).num_milliseconds())
            } else {
                None
            },
        })
        .await;
    }

    async fn handle_status_failed(&self, update: crate::bus::MessageStatusUpdate) {
        if update.status != crate::bus::MessageStatus::Failed {
            return;
        }
        let request_id: u32 = match update.device_message_id.parse() {
            Ok(id) => id,
            Err(_) => return,
        };
        let evicted = self.inner.lock().unwrap().pending.remove(&request_id);
        if let Some(pending) = evicted {
            self.publish_update(TracerouteUpdate {
                request_id,
                target_node_id: pending.target_node_id,
                started_at: pending.started_at,
                updated_at: Utc::now(),
                completed_at: None,
                status: TracerouteStatus::Failed,
                forward_route: vec![],
                forward_snr: vec![],
                return_route: vec![],
                return_snr: vec![],
                error_text: update.reason,
                duration_ms: None,
            })
            .await;
        }
    }

    async fn evict_all(&self, reason: String) {
        let drained: Vec<(u32, Pending)> = self.inner.lock().unwrap().pending.drain().collect();
        for (request_id, pending) in drained {
            self.publish_update(TracerouteUpdate {
                request_id,
                target_node_id: pending.target_node_id,
                started_at: pending.started_at,
                updated_at: Utc::now(),
                completed_at: None,
                status: TracerouteStatus::Failed,
                forward_route: vec![],
                forward_snr: vec![],
                return_route: vec![],
                return_snr: vec![],
                error_text: Some(reason.clone()),
                duration_ms: None,
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::radio::RadioService;
    use crate::store::NodeStore;
    use crate::transport::{ConnectorConfig, SwitchableTransport};

    fn make_service() -> Arc<TracerouteService> {
        let bus = Bus::new();
        let transport = Arc::new(
            SwitchableTransport::new(ConnectorConfig::Ip { host: "127.0.0.1".into(), port: None }).unwrap(),
        );
        let radio = RadioService::new(transport, Arc::new(Codec::new()), bus.clone(), CancellationToken::new());
        let (node_store, _listener) = NodeStore::new();
        TracerouteService::new(bus, radio, Arc::new(node_store), CancellationToken::new())
    }

    #[tokio::test]
    async fn start_without_connection_fails_fast() {
        let service = make_service();
        let err = service.start(0x42).await.unwrap_err();
        assert!(matches!(err, TracerouteError::NotConnected));
    }
}
