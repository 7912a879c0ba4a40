//! Runtime configuration.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default multicast group used for broadcasts and node queries.
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 77), 47077);

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Group and port every node listens on.
    pub group: SocketAddrV4,
    /// Local interface to join the group on.
    pub interface: Ipv4Addr,
    /// Hop limit, 1 keeps datagrams on the local segment.
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            group: DEFAULT_MULTICAST_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique name of this node on the network.
    pub name: String,
    /// Address the unicast listener binds to.
    pub bind_addr: SocketAddr,
    /// Address advertised to other nodes, when it differs from the bound one.
    pub advertise_addr: Option<SocketAddr>,
    /// Multicast settings; `None` disables broadcasts and node queries.
    pub multicast: Option<MulticastConfig>,
    /// Extra resolution attempts after the first one.
    pub resolve_retries: u32,
    /// How long each resolution attempt waits for a reply.
    pub resolve_interval: Duration,
    /// How long the dispatcher waits for an acknowledgement.
    pub ack_timeout: Duration,
    /// Per-call deadline; `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Capacity of the outbound and inbound queues.
    pub queue_capacity: usize,
    /// Forget a node's cached address when a call to it fails with CONNFAIL.
    pub evict_on_connfail: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertise_addr: None,
            multicast: Some(MulticastConfig::default()),
            resolve_retries: 2,
            resolve_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(5),
            call_timeout: Some(Duration::from_secs(30)),
            queue_capacity: 1024,
            evict_on_connfail: true,
        }
    }
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    pub fn with_multicast(mut self, multicast: Option<MulticastConfig>) -> Self {
        self.multicast = multicast;
        self
    }

    pub fn with_resolve(mut self, retries: u32, interval: Duration) -> Self {
        self.resolve_retries = retries;
        self.resolve_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_evict_on_connfail(mut self, evict: bool) -> Self {
        self.evict_on_connfail = evict;
        self
    }

    /// Total number of resolution attempts, never fewer than one.
    pub fn resolve_attempts(&self) -> u32 {
        self.resolve_retries.saturating_add(1)
    }
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_defaults() {
        let config = Config::new("A");
        assert_eq!(config.name, "A");
        assert_eq!(config.resolve_attempts(), 3);
        assert_eq!(config.resolve_interval, Duration::from_millis(500));
        assert_eq!(
            config.multicast.as_ref().map(|m| m.group),
            Some(DEFAULT_MULTICAST_GROUP)
        );
        assert!(config.evict_on_connfail);
    }

    #[test]
    fn test_default_name_is_not_empty() {
        assert!(!Config::default().name.is_empty());
    }
}
