//! Node-discovery projection: re-publishes `node.discovered` the first time
//! a NodeID is observed (spec.md §3 `NodeDiscovered`). The codec already
//! tags `ConfigPhase` discoveries as they arrive; this projection covers the
//! remaining path — a node first heard from via a non-config packet (a
//! NodeInfo broadcast, telemetry, or position report).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, DiscoverySource, Event, NodeDiscovered, Topic};
use crate::store::NodeStore;

pub struct DiscoveryService {
    bus: Bus,
    node_store: Arc<NodeStore>,
    seen: Mutex<HashSet<String>>,
}

impl DiscoveryService {
    pub fn new(bus: Bus, node_store: Arc<NodeStore>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            node_store,
            seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut sub = self.bus.subscribe(&[Topic::NodeInfo, Topic::NodeDiscovered]).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = sub.rx.recv() => {
                        match maybe {
                            Some(Event::NodeDiscovered(d)) => {
                                self.seen.lock().await.insert(d.node.node_id.clone());
                            }
                            Some(Event::NodeInfo(update)) => self.handle_node_update(update.node).await,
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_node_update(&self, node: crate::store::Node) {
        let already_known = {
            let mut seen = self.seen.lock().await;
            !seen.insert(node.node_id.clone())
        };
        if already_known {
            return;
        }
        // A genuinely new NodeID: the store may already hold it from a prior
        // run's bootstrap load, in which case this is not a fresh discovery.
        if self.node_store.get(&node.node_id).await.is_some() {
            return;
        }
        self.bus
            .publish(
                Topic::NodeDiscovered,
                Event::NodeDiscovered(NodeDiscovered {
                    node,
                    discovered_at: chrono::Utc::now(),
                    source: DiscoverySource::LivePacket,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{NodeUpdate, NodeUpdateKind};
    use crate::store::Node;
    use std::time::Duration;

    fn node(id: &str) -> Node {
        Node { node_id: id.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn first_sighting_of_a_node_is_announced_once() {
        let bus = Bus::new();
        let (node_store, _listener) = NodeStore::new();
        let service = DiscoveryService::new(bus.clone(), Arc::new(node_store));
        let cancel = CancellationToken::new();
        let mut discovered_sub = bus.subscribe(&[Topic::NodeDiscovered]).await;
        service.clone().start(cancel.clone());

        bus.publish(
            Topic::NodeInfo,
            Event::NodeInfo(NodeUpdate { kind: NodeUpdateKind::NodeInfoPacket, node: node("!1") }),
        )
        .await;
        bus.publish(
            Topic::NodeInfo,
            Event::NodeInfo(NodeUpdate { kind: NodeUpdateKind::NodeInfoPacket, node: node("!1") }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut announcements = 0;
        while let Ok(Event::NodeDiscovered(_)) = discovered_sub.rx.try_recv() {
            announcements += 1;
        }
        assert_eq!(announcements, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn node_already_present_from_bootstrap_is_not_announced() {
        let bus = Bus::new();
        let (node_store, _listener) = NodeStore::new();
        node_store.upsert(node("!2")).await;
        let service = DiscoveryService::new(bus.clone(), Arc::new(node_store));
        let cancel = CancellationToken::new();
        let mut discovered_sub = bus.subscribe(&[Topic::NodeDiscovered]).await;
        service.start(cancel.clone());

        bus.publish(
            Topic::NodeInfo,
            Event::NodeInfo(NodeUpdate { kind: NodeUpdateKind::NodeInfoPacket, node: node("!2") }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(discovered_sub.rx.try_recv().is_err());
        cancel.cancel();
    }
}
