//! Notification policy (spec.md §2 item 7). Decides *whether* and *what* to
//! notify for; delivery is an external collaborator (spec.md §1) reached
//! through the [`NotificationSink`] trait object the runtime facade wires up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, ConnectionState, Event, Topic};
use crate::config::NotificationEventsConfig;

/// A single notification to hand to the platform-specific delivery backend.
#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

/// External collaborator: actually shows a notification to the user. The
/// runtime facade supplies a concrete implementation (a no-op one in
/// headless contexts); this crate never implements delivery itself.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// A sink that drops every notification, for headless/test runs.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _notification: Notification) {}
}

pub struct NotificationService {
    bus: Bus,
    sink: Arc<dyn NotificationSink>,
    events: NotificationEventsConfig,
    app_focused: std::sync::atomic::AtomicBool,
    notify_when_focused: bool,
}

impl NotificationService {
    pub fn new(
        bus: Bus,
        sink: Arc<dyn NotificationSink>,
        events: NotificationEventsConfig,
        notify_when_focused: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            sink,
            events,
            app_focused: std::sync::atomic::AtomicBool::new(false),
            notify_when_focused,
        })
    }

    pub fn set_focused(&self, focused: bool) {
        self.app_focused.store(focused, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            eprintln!("DEBUG: subscribing");
            let mut sub = self
                .bus
                .subscribe(&[Topic::TextMessage, Topic::NodeDiscovered, Topic::ConnStatus, Topic::UpdateSnapshot])
                .await;
            eprintln!("DEBUG: subscribed");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        eprintln!("DEBUG: got event {:?}", maybe.is_some());
                        let Some(event) = maybe else { break };
                        self.handle(event).await;
                    }
                }
            }
        });
    }

    async fn handle(&self, event: Event) {
        if self.suppressed() {
            return;
        }
        let notification = match event {
            Event::TextMessage(msg) if self.events.incoming_message && msg.direction == crate::store::Direction::In => {
                Some(Notification {
                    title: "New message".into(),
                    body: msg.body,
                })
            }
            Event::NodeDiscovered(d) if self.events.node_discovered => Some(Notification {
                title: "New node".into(),
                body: format!("{} ({})", d.node.long_name, d.node.node_id),
            }),
            Event::ConnStatus(status) if self.events.connection_status && status.state != ConnectionState::Connecting => {
                Some(Notification {
                    title: "Connection".into(),
                    body: format!("{:?}", status.state),
                })
            }
            Event::UpdateSnapshot(snap) if self.events.update_available && snap.update_available => Some(Notification {
                title: "Update available".into(),
                body: snap.latest_version.unwrap_or_default(),
            }),
            _ => None,
        };
        if let Some(n) = notification {
            self.sink.notify(n).await;
        }
    }

    fn suppressed(&self) -> bool {
        !self.notify_when_focused && self.app_focused.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatMessage, Direction, MessageStatus};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingSink {
        notifications: StdMutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for CapturingSink {
        async fn notify(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }

    fn incoming_message(body: &str) -> ChatMessage {
        ChatMessage {
            local_id: 0,
            device_message_id: String::new(),
            chat_key: "channel:0".into(),
            direction: Direction::In,
            body: body.into(),
            status: MessageStatus::Acked,
            status_reason: None,
            at: 0,
            meta_json: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn incoming_message_notifies_when_enabled() {
        let bus = Bus::new();
        let sink = Arc::new(CapturingSink::default());
        let service = NotificationService::new(bus.clone(), sink.clone(), NotificationEventsConfig::default(), false);
        let cancel = CancellationToken::new();
        service.start(cancel.clone());

        bus.publish(Topic::TextMessage, Event::TextMessage(incoming_message("hi there"))).await;
        settle().await;

        let notifications = sink.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].body, "hi there");
        cancel.cancel();
    }

    #[tokio::test]
    async fn outbound_message_never_notifies() {
        let bus = Bus::new();
        let sink = Arc::new(CapturingSink::default());
        let service = NotificationService::new(bus.clone(), sink.clone(), NotificationEventsConfig::default(), false);
        let cancel = CancellationToken::new();
        service.start(cancel.clone());

        let mut outbound = incoming_message("sent by me");
        outbound.direction = Direction::Out;
        bus.publish(Topic::TextMessage, Event::TextMessage(outbound)).await;
        settle().await;

        assert!(sink.notifications.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_event_kind_is_never_surfaced() {
        let bus = Bus::new();
        let sink = Arc::new(CapturingSink::default());
        let events = NotificationEventsConfig { incoming_message: false, ..Default::default() };
        let service = NotificationService::new(bus.clone(), sink.clone(), events, false);
        let cancel = CancellationToken::new();
        service.start(cancel.clone());

        bus.publish(Topic::TextMessage, Event::TextMessage(incoming_message("hi"))).await;
        settle().await;

        assert!(sink.notifications.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn focused_app_suppresses_notifications_unless_opted_in() {
        let bus = Bus::new();
        let sink = Arc::new(CapturingSink::default());
        let service = NotificationService::new(bus.clone(), sink.clone(), NotificationEventsConfig::default(), false);
        service.set_focused(true);
        let cancel = CancellationToken::new();
        service.clone().start(cancel.clone());

        bus.publish(Topic::TextMessage, Event::TextMessage(incoming_message("hi"))).await;
        settle().await;
        assert!(sink.notifications.lock().unwrap().is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn notify_when_focused_opt_in_still_delivers() {
        let bus = Bus::new();
        let sink = Arc::new(CapturingSink::default());
        let service = NotificationService::new(bus.clone(), sink.clone(), NotificationEventsConfig::default(), true);
        service.set_focused(true);
        let cancel = CancellationToken::new();
        service.clone().start(cancel.clone());

        bus.publish(Topic::TextMessage, Event::TextMessage(incoming_message("hi"))).await;
        settle().await;
        assert_eq!(sink.notifications.lock().unwrap().len(), 1);

        cancel.cancel();
    }
}
