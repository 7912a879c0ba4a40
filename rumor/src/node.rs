//! Node identity and the name to address cache.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Sentinel node name meaning "this process".
pub const SELF: &str = ".";

/// A named participant in the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Node {
            name: name.into(),
            address,
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "node(name={}, addr={})", self.name, self.address)
    }
}

/// An address is "empty" when it cannot be dialed, e.g. a source address
/// reported by a node that never learned its own public address.
pub fn is_empty_address(addr: &SocketAddr) -> bool {
    addr.ip().is_unspecified() || addr.port() == 0
}

#[derive(Debug, Clone)]
struct CacheEntry {
    address: Option<SocketAddr>,
    recorded_at: DateTime<Utc>,
}

/// Caches `name -> address` bindings and owns the local node's identity.
///
/// Entries never expire on their own. They are overwritten by newer reports
/// for the same name (last writer wins) and removed with [`NodeDirectory::forget`].
pub struct NodeDirectory {
    self_node: Node,
    entries: RwLock<HashMap<String, CacheEntry>>,
    changed: Notify,
}

impl NodeDirectory {
    pub fn new(self_node: Node) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            self_node.name.clone(),
            CacheEntry {
                address: Some(self_node.address),
                recorded_at: Utc::now(),
            },
        );
        NodeDirectory {
            self_node,
            entries: RwLock::new(entries),
            changed: Notify::new(),
        }
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// `None` when the name was never seen, `Some(None)` when the name is known
    /// but its address is empty.
    pub fn cached_address(&self, name: &str) -> Option<Option<SocketAddr>> {
        self.entries.read().get(name).map(|entry| entry.address)
    }

    pub fn record_address(&self, name: &str, address: SocketAddr) {
        if name.is_empty() || name == SELF {
            return;
        }
        if name == self.self_node.name {
            if address != self.self_node.address {
                tracing::warn!(node=%name, addr=%address, "Ignoring address report for the local node");
            }
            return;
        }
        let address = (!is_empty_address(&address)).then_some(address);
        let previous = self.entries.write().insert(
            name.to_string(),
            CacheEntry {
                address,
                recorded_at: Utc::now(),
            },
        );

        match previous {
            Some(previous) if previous.address == address => {}
            Some(previous) => {
                tracing::debug!(
                    node=%name,
                    old=?previous.address,
                    new=?address,
                    since=%previous.recorded_at,
                    "Node address changed"
                );
                self.changed.notify_waiters();
            }
            None => {
                tracing::debug!(node=%name, addr=?address, "Learned node address");
                self.changed.notify_waiters();
            }
        }
    }

    /// Drop a cached binding so the next lookup re-resolves. The local node is
    /// never forgotten.
    pub fn forget(&self, name: &str) -> bool {
        if name == self.self_node.name {
            return false;
        }
        self.entries.write().remove(name).is_some()
    }

    /// Wait for the next change to the cache.
    ///
    /// Call `enable()` on the returned future before checking the cache to
    /// avoid missing a change that lands in between.
    pub fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.changed.notified()
    }

    /// When the binding for `name` was last reported.
    pub fn last_seen(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.read().get(name).map(|entry| entry.recorded_at)
    }

    /// Names whose binding has not been reported for longer than `age`.
    /// The local node is never stale.
    pub fn stale_nodes(&self, age: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - age;
        let mut stale: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(name, entry)| *name != &self.self_node.name && entry.recorded_at < cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn known_nodes(&self) -> Vec<Node> {
        self.entries
            .read()
            .iter()
            .filter_map(|(name, entry)| entry.address.map(|addr| Node::new(name.clone(), addr)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 9000))
    }

    #[test]
    fn test_self_is_cached_and_never_forgotten() {
        let directory = NodeDirectory::new(Node::new("A", addr(1)));
        assert_eq!(directory.cached_address("A"), Some(Some(addr(1))));
        assert!(!directory.forget("A"));
        assert_eq!(directory.cached_address("A"), Some(Some(addr(1))));
    }

    #[test]
    fn test_record_empty_and_overwrite() {
        let directory = NodeDirectory::new(Node::new("A", addr(1)));
        assert_eq!(directory.cached_address("B"), None);

        directory.record_address("B", SocketAddr::from(([0, 0, 0, 0], 9000)));
        assert_eq!(directory.cached_address("B"), Some(None));

        directory.record_address("B", addr(2));
        directory.record_address("B", addr(3));
        assert_eq!(directory.cached_address("B"), Some(Some(addr(3))));

        assert!(directory.forget("B"));
        assert_eq!(directory.cached_address("B"), None);
    }

    #[test]
    fn test_self_binding_cannot_be_overwritten() {
        let directory = NodeDirectory::new(Node::new("A", addr(1)));
        directory.record_address("A", addr(7));
        assert_eq!(directory.cached_address("A"), Some(Some(addr(1))));
    }

    #[test]
    fn test_sentinel_is_not_recorded() {
        let directory = NodeDirectory::new(Node::new("A", addr(1)));
        directory.record_address(SELF, addr(9));
        assert_eq!(directory.cached_address(SELF), None);
        assert_eq!(directory.known_nodes().len(), 1);
    }

    #[test]
    fn test_reports_refresh_last_seen() {
        let directory = NodeDirectory::new(Node::new("A", addr(1)));
        assert_eq!(directory.last_seen("B"), None);

        directory.record_address("B", addr(2));
        let first = directory.last_seen("B").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        directory.record_address("B", addr(2));
        assert!(directory.last_seen("B").unwrap() > first);

        assert!(directory.stale_nodes(chrono::Duration::hours(1)).is_empty());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(
            directory.stale_nodes(chrono::Duration::milliseconds(1)),
            vec!["B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_changed_wakes_on_new_binding() {
        let directory = std::sync::Arc::new(NodeDirectory::new(Node::new("A", addr(1))));
        let changed = directory.changed();
        tokio::pin!(changed);
        changed.as_mut().enable();

        directory.record_address("B", addr(2));
        tokio::time::timeout(std::time::Duration::from_secs(1), changed)
            .await
            .expect("change notification");
    }
}
