//! Node registry fed by UDP heartbeats.
//!
//! Tracks every file node that has ever announced itself, along with its
//! cumulative download load and whether it is currently online. Records are
//! never deleted; a node that stops sending heartbeats is only marked
//! offline and comes back with its load intact.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A file node known to the proxy.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// Address the node's heartbeats arrive from.
    pub address: IpAddr,
    /// TCP port the node accepts requests on.
    pub listen_port: u16,
    /// Total bytes of downloads routed to this node so far.
    pub cumulative_load: u64,
    /// When the last heartbeat arrived.
    pub last_seen: Instant,
    /// Whether the node currently counts as reachable.
    pub online: bool,
}

impl NodeRecord {
    /// Registry key of this record.
    pub fn key(&self) -> String {
        node_key(self.address, self.listen_port)
    }
}

/// Registry key: one entry per address/port pair.
pub fn node_key(address: IpAddr, listen_port: u16) -> String {
    format!("{}:{}", address, listen_port)
}

/// Registry of file nodes, keyed by address and TCP port.
pub struct NodeRegistry {
    nodes: DashMap<String, NodeRecord>,
    offline_after: Duration,
}

impl NodeRegistry {
    /// Create an empty registry. Nodes are swept offline once they go
    /// `offline_after` without a heartbeat.
    pub fn new(offline_after: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            offline_after,
        }
    }

    /// Record a heartbeat from `address` announcing `listen_port`.
    ///
    /// Unknown nodes are added online with zero load. Known nodes get their
    /// timestamp refreshed and come back online immediately, without
    /// waiting for the next sweep.
    pub fn record_heartbeat(&self, address: IpAddr, listen_port: u16) {
        match self.nodes.entry(node_key(address, listen_port)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let was_offline = !record.online;
                record.last_seen = Instant::now();
                record.online = true;
                if was_offline {
                    info!(node = %entry.key(), "node back online");
                }
            }
            Entry::Vacant(entry) => {
                info!(node = %entry.key(), "node registered");
                entry.insert(NodeRecord {
                    address,
                    listen_port,
                    cumulative_load: 0,
                    last_seen: Instant::now(),
                    online: true,
                });
            }
        }
    }

    /// Pick the online node with the least cumulative load.
    ///
    /// Ties keep the candidate seen first.
    pub fn least_loaded(&self) -> Option<NodeRecord> {
        let mut best: Option<NodeRecord> = None;
        for entry in self.nodes.iter() {
            let node = entry.value();
            if !node.online {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| node.cumulative_load < b.cumulative_load)
            {
                best = Some(node.clone());
            }
        }
        best
    }

    /// Add `bytes` to a node's cumulative load.
    pub fn add_load(&self, key: &str, bytes: u64) {
        if let Some(mut record) = self.nodes.get_mut(key) {
            record.cumulative_load += bytes;
            debug!(node = %key, load = record.cumulative_load, "load recorded");
        }
    }

    /// Re-evaluate the online flag of every record against the timeout.
    ///
    /// Flips records both ways and never removes them.
    pub fn sweep(&self) {
        let now = Instant::now();
        for mut entry in self.nodes.iter_mut() {
            let alive = now.duration_since(entry.last_seen) <= self.offline_after;
            if entry.online && !alive {
                entry.online = false;
                info!(node = %entry.key(), "node went offline");
            } else if !entry.online && alive {
                entry.online = true;
                info!(node = %entry.key(), "node back online");
            }
        }
    }

    /// Snapshot of every record in key order, for the console dump.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> =
            self.nodes.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.key());
        records
    }

    /// Number of known nodes, online or not.
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Force a record's online flag, for tests that need a fixed topology.
    #[cfg(test)]
    pub fn set_online(&self, key: &str, online: bool) {
        if let Some(mut record) = self.nodes.get_mut(key) {
            record.online = online;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(3))
    }

    #[test]
    fn heartbeat_registers_online_node() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 12300);
        assert_eq!(reg.count(), 1);
        let node = reg.least_loaded().unwrap();
        assert_eq!(node.listen_port, 12300);
        assert_eq!(node.cumulative_load, 0);
        assert!(node.online);
    }

    #[test]
    fn repeated_heartbeat_keeps_one_record() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 12300);
        reg.record_heartbeat(ADDR, 12300);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn least_loaded_skips_offline_nodes() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 1);
        reg.record_heartbeat(ADDR, 2);
        reg.record_heartbeat(ADDR, 3);
        reg.add_load(&node_key(ADDR, 1), 50);
        reg.add_load(&node_key(ADDR, 2), 10);
        reg.add_load(&node_key(ADDR, 3), 30);
        reg.set_online(&node_key(ADDR, 2), false);

        assert_eq!(reg.least_loaded().unwrap().listen_port, 3);
    }

    #[test]
    fn least_loaded_is_none_when_all_offline() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 1);
        reg.set_online(&node_key(ADDR, 1), false);
        assert!(reg.least_loaded().is_none());
    }

    #[test]
    fn load_accumulates() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 1);
        reg.add_load(&node_key(ADDR, 1), 100);
        reg.add_load(&node_key(ADDR, 1), 42);
        assert_eq!(reg.least_loaded().unwrap().cumulative_load, 142);
    }

    #[test]
    fn sweep_marks_stale_nodes_offline_but_keeps_them() {
        let reg = NodeRegistry::new(Duration::ZERO);
        reg.record_heartbeat(ADDR, 1);
        std::thread::sleep(Duration::from_millis(5));
        reg.sweep();
        assert_eq!(reg.count(), 1);
        assert!(reg.least_loaded().is_none());
    }

    #[test]
    fn heartbeat_revives_offline_node() {
        let reg = NodeRegistry::new(Duration::ZERO);
        reg.record_heartbeat(ADDR, 1);
        std::thread::sleep(Duration::from_millis(5));
        reg.sweep();
        assert!(reg.least_loaded().is_none());

        reg.record_heartbeat(ADDR, 1);
        assert!(reg.least_loaded().unwrap().online);
    }

    #[test]
    fn sweep_restores_recently_seen_nodes() {
        let reg = registry();
        reg.record_heartbeat(ADDR, 1);
        reg.set_online(&node_key(ADDR, 1), false);
        reg.sweep();
        assert!(reg.least_loaded().is_some());
    }
}
