//! Ack normalization (spec.md §4.4, "critical"). Meshtastic acks a broadcast
//! as soon as the first hop repeats the frame — that is not delivery. This
//! tracker downgrades those to `Sent` before anything downstream ever sees
//! them, which is the whole reason the radio service exists as a layer above
//! the codec rather than folding ack handling into it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::bus::{MessageStatus, MessageStatusUpdate};
use crate::codec::BROADCAST_NUM;

/// Maps an in-flight `DeviceMessageID` to the node number it targeted.
pub struct AckTracker {
    inner: Mutex<HashMap<String, u32>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, device_message_id: String, target_node_num: u32) {
        self.inner.lock().unwrap().insert(device_message_id, target_node_num);
    }

    /// Apply the normalization rule in place, returning the update to
    /// publish. Clears tracking on `Failed` or on a confirmed terminal ack.
    pub fn normalize(&self, mut update: MessageStatusUpdate) -> MessageStatusUpdate {
        if update.status == MessageStatus::Failed {
            self.inner.lock().unwrap().remove(&update.device_message_id);
            return update;
        }
        if update.status != MessageStatus::Acked {
            return update;
        }

        let mut guard = self.inner.lock().unwrap();
        let Some(&target) = guard.get(&update.device_message_id) else {
            return update;
        };

        if target == BROADCAST_NUM {
            update.status = MessageStatus::Sent;
            guard.remove(&update.device_message_id);
        } else if update.from_node_num != 0 && update.from_node_num != target {
            // Relay ack: downgrade, keep tracking for the destination's own ack.
            update.status = MessageStatus::Sent;
        } else {
            // Either the destination acked, or FromNodeNum == 0 (treated as
            // authoritative local ack per spec.md §9) — keep Acked.
            guard.remove(&update.device_message_id);
        }
        update
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acked(id: &str, from: u32) -> MessageStatusUpdate {
        MessageStatusUpdate {
            device_message_id: id.to_string(),
            status: MessageStatus::Acked,
            reason: None,
            from_node_num: from,
        }
    }

    #[test]
    fn untracked_passes_through_unchanged() {
        let tracker = AckTracker::new();
        let update = tracker.normalize(acked("x", 0xAA));
        assert_eq!(update.status, MessageStatus::Acked);
    }

    #[test]
    fn broadcast_ack_downgrades_to_sent() {
        let tracker = AckTracker::new();
        tracker.track("1".into(), BROADCAST_NUM);
        let update = tracker.normalize(acked("1", 0xAA));
        assert_eq!(update.status, MessageStatus::Sent);
    }

    #[test]
    fn relay_ack_downgrades_but_keeps_tracking() {
        let tracker = AckTracker::new();
        tracker.track("202".into(), 0xCAFE);
        let relay = tracker.normalize(acked("202", 0xBEEF));
        assert_eq!(relay.status, MessageStatus::Sent);
        let destination = tracker.normalize(acked("202", 0xCAFE));
        assert_eq!(destination.status, MessageStatus::Acked);
    }

    #[test]
    fn from_node_num_zero_is_authoritative() {
        let tracker = AckTracker::new();
        tracker.track("5".into(), 0xAA);
        let update = tracker.normalize(acked("5", 0));
        assert_eq!(update.status, MessageStatus::Acked);
    }

    #[test]
    fn failed_clears_tracking_regardless() {
        let tracker = AckTracker::new();
        tracker.track("9".into(), 0xAA);
        let failed = MessageStatusUpdate {
            device_message_id: "9".into(),
            status: MessageStatus::Failed,
            reason: Some("nak".into()),
            from_node_num: 0,
        };
        tracker.normalize(failed);
        // Tracking cleared: a subsequent relay-looking ack now passes through.
        let update = tracker.normalize(acked("9", 0xBEEF));
        assert_eq!(update.status, MessageStatus::Acked);
    }
}
