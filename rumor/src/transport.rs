//! Transports move encoded frames between nodes.
//!
//! A [`Transport`] is only ever held by the outbound dispatcher. Each unicast
//! delivery opens a fresh connection, writes one envelope frame, waits for one
//! acknowledgement frame and closes the connection. Broadcasts are a single
//! multicast datagram with no acknowledgement.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};

use crate::config::MulticastConfig;
use crate::envelope::Envelope;
use crate::errors::{RuntimeError, TransportError};
use crate::net::{Ack, FrameReader, FrameWriter};

/// Network operations available to the dispatcher
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one encoded envelope frame to `to` and wait for its acknowledgement.
    ///
    /// Fails with [`TransportError::Connect`] when the destination cannot be
    /// reached and [`TransportError::NoAck`] when it accepted the connection
    /// but did not acknowledge the frame.
    async fn deliver(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError>;

    /// Send one encoded envelope frame to every node on the segment.
    async fn multicast(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// TCP for unicast, UDP multicast for broadcasts.
pub struct TcpTransport {
    ack_timeout: Duration,
    multicast: Option<(UdpSocket, SocketAddrV4)>,
}

impl TcpTransport {
    pub async fn new(
        ack_timeout: Duration,
        multicast: Option<&MulticastConfig>,
    ) -> Result<Self, RuntimeError> {
        let multicast = match multicast {
            Some(config) => {
                let socket = UdpSocket::bind(SocketAddr::from((config.interface, 0)))
                    .await
                    .map_err(RuntimeError::Multicast)?;
                socket
                    .set_multicast_ttl_v4(config.ttl)
                    .map_err(RuntimeError::Multicast)?;
                // Nodes sharing a host must see each other's queries.
                socket
                    .set_multicast_loop_v4(true)
                    .map_err(RuntimeError::Multicast)?;
                Some((socket, config.group))
            }
            None => None,
        };

        Ok(TcpTransport {
            ack_timeout,
            multicast,
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    #[tracing::instrument(level = "trace", skip(self, frame), fields(len = frame.len()))]
    async fn deliver(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        let stream = TcpStream::connect(to)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (read, write) = stream.into_split();
        let mut writer = FrameWriter::<Envelope>::new(Box::new(write));
        let mut reader = FrameReader::<Ack>::new(Box::new(read));

        if let Err(e) = writer.write_encoded(&frame).await {
            return Err(TransportError::NoAck(e.to_string()));
        }

        let result = match tokio::time::timeout(self.ack_timeout, reader.read_frame()).await {
            Ok(Ok(Some(ack))) if ack.is_ok() => Ok(()),
            Ok(Ok(Some(ack))) => Err(TransportError::NoAck(
                ack.payload
                    .failure_reason()
                    .cloned()
                    .unwrap_or_else(|| "rejected".to_string()),
            )),
            Ok(Ok(None)) => Err(TransportError::NoAck(
                "connection closed before acknowledgement".to_string(),
            )),
            Ok(Err(e)) => Err(TransportError::NoAck(e.to_string())),
            Err(_) => Err(TransportError::NoAck(format!(
                "no acknowledgement within {:?}",
                self.ack_timeout
            ))),
        };

        writer.close().await;
        result
    }

    async fn multicast(&self, frame: Bytes) -> Result<(), TransportError> {
        let Some((socket, group)) = &self.multicast else {
            return Err(TransportError::Multicast(
                "multicast is disabled".to_string(),
            ));
        };
        socket
            .send_to(&frame, SocketAddr::V4(*group))
            .await
            .map_err(|e| TransportError::Multicast(e.to_string()))?;
        Ok(())
    }
}

/// Bind a socket that receives datagrams sent to the multicast group.
///
/// Address reuse is enabled so several nodes on one host can listen on the
/// same group port.
pub(crate) fn bind_multicast_receiver(config: &MulticastConfig) -> Result<UdpSocket, RuntimeError> {
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(RuntimeError::Multicast)?;
    socket
        .set_reuse_address(true)
        .map_err(RuntimeError::Multicast)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(RuntimeError::Multicast)?;
    socket
        .set_nonblocking(true)
        .map_err(RuntimeError::Multicast)?;

    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port());
    socket
        .bind(&SockAddr::from(bind))
        .map_err(RuntimeError::Multicast)?;
    socket
        .join_multicast_v4(config.group.ip(), &config.interface)
        .map_err(RuntimeError::Multicast)?;

    UdpSocket::from_std(socket.into()).map_err(RuntimeError::Multicast)
}

/// Best guess at an address other hosts can reach us on when we are bound to
/// the unspecified address. Nothing is sent, connecting a UDP socket only
/// selects the outgoing interface.
pub(crate) fn guess_reachable_ip() -> Ipv4Addr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr {
            SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}
