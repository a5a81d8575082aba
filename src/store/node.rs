//! Node store: the in-memory view of every mesh participant the local radio
//! has observed, keyed by node id and merged with preserve-nonzero semantics
//! (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bus::{Bus, Event, NodeUpdateKind, Topic};

use super::{monotone_timestamp, now_ms, ChangeListener, ChangeNotifier};

/// A mesh participant observed by the local radio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub node_num: u32,
    pub long_name: String,
    pub short_name: String,
    pub board_model: String,
    pub role: String,
    pub channel: Option<u32>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub pressure: Option<f32>,
    pub air_quality_index: Option<u32>,
    pub power_voltage: Option<f32>,
    pub power_current: Option<f32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub is_unmessageable: bool,
    pub last_heard_at: i64,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub updated_at: i64,
}

/// Merge `incoming` onto `existing` in place, preserve-nonzero.
///
/// For every scalar field: a zero/empty/`None` incoming value keeps the
/// existing one; otherwise the incoming value wins. `last_heard_at` and
/// `updated_at` are monotone (max of the two), with a zero incoming
/// `updated_at` treated as "now" rather than "unset".
fn merge_node(existing: &mut Node, incoming: Node) {
    if !incoming.long_name.is_empty() {
        existing.long_name = incoming.long_name;
    }
    if !incoming.short_name.is_empty() {
        existing.short_name = incoming.short_name;
    }
    if !incoming.board_model.is_empty() {
        existing.board_model = incoming.board_model;
    }
    if !incoming.role.is_empty() {
        existing.role = incoming.role;
    }
    if incoming.channel.is_some() {
        existing.channel = incoming.channel;
    }
    if incoming.battery_level.is_some() {
        existing.battery_level = incoming.battery_level;
    }
    if incoming.voltage.is_some() {
        existing.voltage = incoming.voltage;
    }
    if incoming.temperature.is_some() {
        existing.temperature = incoming.temperature;
    }
    if incoming.humidity.is_some() {
        existing.humidity = incoming.humidity;
    }
    if incoming.pressure.is_some() {
        existing.pressure = incoming.pressure;
    }
    if incoming.air_quality_index.is_some() {
        existing.air_quality_index = incoming.air_quality_index;
    }
    if incoming.power_voltage.is_some() {
        existing.power_voltage = incoming.power_voltage;
    }
    if incoming.power_current.is_some() {
        existing.power_current = incoming.power_current;
    }
    if incoming.latitude.is_some() {
        existing.latitude = incoming.latitude;
    }
    if incoming.longitude.is_some() {
        existing.longitude = incoming.longitude;
    }
    if incoming.altitude.is_some() {
        existing.altitude = incoming.altitude;
    }
    if incoming.is_unmessageable {
        existing.is_unmessageable = true;
    }
    if incoming.rssi.is_some() {
        existing.rssi = incoming.rssi;
    }
    if incoming.snr.is_some() {
        existing.snr = incoming.snr;
    }
    existing.last_heard_at = monotone_timestamp(existing.last_heard_at, incoming.last_heard_at);
    existing.updated_at = if incoming.updated_at == 0 {
        now_ms().max(existing.updated_at)
    } else {
        monotone_timestamp(existing.updated_at, incoming.updated_at)
    };
}

struct Inner {
    nodes: HashMap<String, Node>,
}

/// Owns the map NodeID→Node and a single-slot change notifier.
pub struct NodeStore {
    inner: Arc<RwLock<Inner>>,
    notifier: ChangeNotifier,
}

impl NodeStore {
    pub fn new() -> (Self, ChangeListener) {
        let (notifier, listener) = ChangeNotifier::new();
        (
            Self {
                inner: Arc::new(RwLock::new(Inner {
                    nodes: HashMap::new(),
                })),
                notifier,
            },
            listener,
        )
    }

    /// Merge `node` into the store, preserve-nonzero (spec.md §4.5).
    pub async fn upsert(&self, node: Node) {
        let mut inner = self.inner.write().await;
        match inner.nodes.get_mut(&node.node_id) {
            Some(existing) => merge_node(existing, node),
            None => {
                let mut n = node;
                if n.updated_at == 0 {
                    n.updated_at = now_ms();
                }
                inner.nodes.insert(n.node_id.clone(), n);
            }
        }
        drop(inner);
        self.notifier.notify();
    }

    pub async fn get(&self, node_id: &str) -> Option<Node> {
        self.inner.read().await.nodes.get(node_id).cloned()
    }

    /// Snapshot sorted by `last_heard_at` descending.
    pub async fn snapshot_sorted(&self) -> Vec<Node> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| b.last_heard_at.cmp(&a.last_heard_at));
        nodes
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.nodes.clear();
        drop(inner);
        self.notifier.notify();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    /// Load a batch of nodes at bootstrap, before the bus begins delivering.
    pub async fn load_bootstrap(&self, nodes: Vec<Node>) {
        let mut inner = self.inner.write().await;
        for node in nodes {
            inner.nodes.insert(node.node_id.clone(), node);
        }
    }

    /// Subscribe to `node.info` and upsert the contained node for every
    /// `NodeUpdate` (spec.md §4.5 `Start`).
    pub fn start(self: Arc<Self>, bus: Bus, cancel: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            let mut sub = bus.subscribe(&[Topic::NodeInfo]).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        match maybe {
                            Some(Event::NodeInfo(update)) => {
                                let _kind: NodeUpdateKind = update.kind;
                                self.upsert(update.node).await;
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

    fn node(id: &str) -> Node {
        Node {
            node_id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sparse_upsert_preserves_other_fields() {
        let (store, _listener) = NodeStore::new();
        store
            .upsert(Node {
                long_name: "Alpha".into(),
                battery_level: Some(80),
                last_heard_at: 100,
                ..node("!0000002a")
            })
            .await;
        store
            .upsert(Node {
                long_name: "Alpha Prime".into(),
                ..node("!0000002a")
            })
            .await;
        let got = store.get("!0000002a").await.unwrap();
        assert_eq!(got.long_name, "Alpha Prime");
        assert_eq!(got.battery_level, Some(80));
    }

    #[tokio::test]
    async fn last_heard_at_is_monotone() {
        let (store, _listener) = NodeStore::new();
        store
            .upsert(Node {
                last_heard_at: 200,
                ..node("!1")
            })
            .await;
        store
            .upsert(Node {
                last_heard_at: 50,
                ..node("!1")
            })
            .await;
        assert_eq!(store.get("!1").await.unwrap().last_heard_at, 200);
    }

    #[tokio::test]
    async fn snapshot_sorted_descending() {
        let (store, _listener) = NodeStore::new();
        store
            .upsert(Node {
                last_heard_at: 10,
                ..node("!a")
            })
            .await;
        store
            .upsert(Node {
                last_heard_at: 99,
                ..node("!b")
            })
            .await;
        let snap = store.snapshot_sorted().await;
        assert_eq!(snap[0].node_id, "!b");
        assert_eq!(snap[1].node_id, "!a");
    }

    #[tokio::test]
    async fn reset_clears_all_state() {
        let (store, _listener) = NodeStore::new();
        store.upsert(node("!a")).await;
        store.reset().await;
        assert_eq!(store.len().await, 0);
    }
}
