//! HTTP update checker (spec.md §1: "explicitly out of scope... only their
//! interfaces are specified in §6" — the actual release feed and its
//! response shape belong to the update host, not this crate; this service
//! owns only the polling cadence and the `UpdateSnapshot` it publishes).

use std::time::Duration;

use chrono::Utc;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Event, Topic, UpdateSnapshot};

const POLL_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct UpdateChecker {
    bus: Bus,
    current_version: String,
    feed_url: String,
}

impl UpdateChecker {
    pub fn new(bus: Bus, current_version: impl Into<String>, feed_url: impl Into<String>) -> Self {
        Self {
            bus,
            current_version: current_version.into(),
            feed_url: feed_url.into(),
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                self.check_once().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        });
    }

    async fn check_once(&self) {
        let snapshot = self.fetch().await.unwrap_or_else(|| UpdateSnapshot {
            current_version: self.current_version.clone(),
            latest_version: None,
            update_available: false,
            checked_at: Utc::now(),
        });
        self.bus.publish(Topic::UpdateSnapshot, Event::UpdateSnapshot(snapshot)).await;
    }

    #[cfg(feature = "update-checker")]
    async fn fetch(&self) -> Option<UpdateSnapshot> {
        let resp = reqwest::get(&self.feed_url).await.ok()?;
        let latest_version = resp.text().await.ok()?.trim().to_string();
        let update_available = !latest_version.is_empty() && latest_version != self.current_version;
        Some(UpdateSnapshot {
            current_version: self.current_version.clone(),
            latest_version: Some(latest_version),
            update_available,
            checked_at: Utc::now(),
        })
    }

    #[cfg(not(feature = "update-checker"))]
    async fn fetch(&self) -> Option<UpdateSnapshot> {
        debug!("update-checker feature disabled, skipping poll of {}", self.feed_url);
        None
    }
}
