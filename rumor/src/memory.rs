//! An in-process network.
//!
//! [`MemoryNetwork`] connects any number of runtimes inside one process
//! without sockets. Frames are still encoded and decoded, so everything above
//! the [`Transport`] runs exactly as it does over TCP. Peers can be killed
//! (connections are refused) or silenced (connections are accepted but never
//! acknowledged) to exercise failure handling.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::errors::TransportError;
use crate::net::Frame;
use crate::runtime::Runtime;
use crate::transport::Transport;

/// Port every in-memory node listens on.
pub const MEMORY_PORT: u16 = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Up,
    Silent,
}

struct Peer {
    inbound: mpsc::Sender<Envelope>,
    state: PeerState,
}

#[derive(Default)]
struct Hub {
    peers: HashMap<SocketAddr, Peer>,
    next_host: u32,
    deliveries: usize,
    multicasts: usize,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a runtime attached to this network.
    ///
    /// The node listens on `config.advertise_addr` when set, otherwise on the
    /// next free address of the form `10.0.0.N:9000`.
    pub fn join(&self, config: Config) -> Runtime {
        let address = config
            .advertise_addr
            .unwrap_or_else(|| self.allocate_address());
        let transport = MemoryTransport {
            network: self.clone(),
            ack_timeout: config.ack_timeout,
        };
        let (runtime, inbound) = Runtime::start(config, address, Arc::new(transport));
        self.hub.lock().peers.insert(
            address,
            Peer {
                inbound,
                state: PeerState::Up,
            },
        );
        runtime
    }

    fn allocate_address(&self) -> SocketAddr {
        let mut hub = self.hub.lock();
        loop {
            hub.next_host += 1;
            let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) + hub.next_host);
            let addr = SocketAddr::from((ip, MEMORY_PORT));
            if !hub.peers.contains_key(&addr) {
                return addr;
            }
        }
    }

    /// Take the listener at `addr` down. Later connections are refused.
    pub fn kill(&self, addr: SocketAddr) -> bool {
        self.hub.lock().peers.remove(&addr).is_some()
    }

    /// Keep accepting connections at `addr` but never acknowledge anything.
    pub fn silence(&self, addr: SocketAddr) -> bool {
        self.set_state(addr, PeerState::Silent)
    }

    /// Undo [`MemoryNetwork::silence`].
    pub fn revive(&self, addr: SocketAddr) -> bool {
        self.set_state(addr, PeerState::Up)
    }

    fn set_state(&self, addr: SocketAddr, state: PeerState) -> bool {
        match self.hub.lock().peers.get_mut(&addr) {
            Some(peer) => {
                peer.state = state;
                true
            }
            None => false,
        }
    }

    /// Number of acknowledged unicast deliveries so far.
    pub fn deliveries(&self) -> usize {
        self.hub.lock().deliveries
    }

    /// Number of multicast sends so far.
    pub fn multicasts(&self) -> usize {
        self.hub.lock().multicasts
    }
}

struct MemoryTransport {
    network: MemoryNetwork,
    ack_timeout: Duration,
}

fn decode(frame: &Bytes) -> Result<Envelope, TransportError> {
    Frame::<Envelope>::decode_datagram(frame)?
        .payload
        .ok()
        .ok_or_else(|| TransportError::NoAck("expected an envelope".to_string()))
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn deliver(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        let envelope = decode(&frame)?;

        let (inbound, state) = match self.network.hub.lock().peers.get(&to) {
            Some(peer) => (peer.inbound.clone(), peer.state),
            None => return Err(TransportError::Connect(format!("connection refused by {to}"))),
        };

        if state == PeerState::Silent {
            tokio::time::sleep(self.ack_timeout).await;
            return Err(TransportError::NoAck(format!(
                "no acknowledgement within {:?}",
                self.ack_timeout
            )));
        }

        inbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::NoAck("inbound queue closed".to_string()))?;
        self.network.hub.lock().deliveries += 1;
        Ok(())
    }

    async fn multicast(&self, frame: Bytes) -> Result<(), TransportError> {
        let envelope = decode(&frame)?;

        let receivers: Vec<_> = {
            let mut hub = self.network.hub.lock();
            hub.multicasts += 1;
            hub.peers
                .values()
                .filter(|peer| peer.state == PeerState::Up)
                .map(|peer| peer.inbound.clone())
                .collect()
        };

        for inbound in receivers {
            let _ = inbound.send(envelope.clone()).await;
        }
        Ok(())
    }
}
