//! Inbound side of the network: accepts unicast connections and receives
//! multicast datagrams, pushing every decoded envelope onto the inbound queue.
//!
//! The listener never sends envelopes, it only acknowledges what it received.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::envelope::Envelope;
use crate::net::{Ack, Frame, FrameReader, FrameWriter};

/// Largest datagram we expect on the multicast group
const MAX_DATAGRAM: usize = 64 * 1024;

/// Accept unicast connections until cancelled.
///
/// Each connection gets `read_timeout` to deliver its envelope. Connection
/// tasks are owned by the accept loop and aborted when it stops.
pub(crate) async fn serve_tcp(
    listener: TcpListener,
    inbound: mpsc::Sender<Envelope>,
    read_timeout: Duration,
    cancellation: CancellationToken,
) {
    let local = listener.local_addr().ok();
    let mut connections = JoinSet::new();
    tracing::info!(addr=?local, "Accepting connections");
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                break;
            },
            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        tracing::error!(error=%e, "Connection task panicked");
                    }
                }
            },
            res = listener.accept() => {
                match res {
                    Ok((stream, peer)) => {
                        let span = tracing::debug_span!("incoming", addr=%peer);
                        connections.spawn(
                            handle_connection(stream, inbound.clone(), read_timeout).instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error=%e, "Failed to accept connection");
                    }
                }
            }
        }
    }
    connections.shutdown().await;
    tracing::info!(addr=?local, "Stopped accepting connections");
}

/// Read exactly one envelope from the connection, enqueue it and acknowledge.
async fn handle_connection(
    stream: TcpStream,
    inbound: mpsc::Sender<Envelope>,
    read_timeout: Duration,
) {
    let peer = stream.peer_addr().ok();
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::<Envelope>::new(Box::new(read));
    let mut writer = FrameWriter::<Ack>::new(Box::new(write));

    let Ok(read) = tokio::time::timeout(read_timeout, reader.read_frame()).await else {
        tracing::debug!(peer=?peer, "Connection sent no envelope in time");
        return;
    };
    let ack = match read {
        Ok(Some(frame)) => match frame.payload.ok() {
            Some(envelope) => {
                let call_id = envelope.call_id();
                match inbound.send(envelope).await {
                    Ok(()) => Frame::ok(Ack { call_id }),
                    Err(_) => Frame::failure("inbound queue closed"),
                }
            }
            None => {
                tracing::warn!(peer=?peer, "Received failure frame instead of an envelope");
                Frame::failure("expected an envelope")
            }
        },
        Ok(None) => {
            tracing::debug!(peer=?peer, "Connection closed before sending an envelope");
            return;
        }
        Err(e) => {
            tracing::warn!(peer=?peer, error=%e, "Dropping malformed envelope");
            Frame::failure(e.to_string())
        }
    };

    if let Err(e) = writer.write_frame(&ack).await {
        tracing::debug!(peer=?peer, error=%e, "Failed to write acknowledgement");
    }
    writer.close().await;
}

pub(crate) async fn serve_multicast(
    socket: UdpSocket,
    inbound: mpsc::Sender<Envelope>,
    cancellation: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                break;
            },
            res = socket.recv_from(&mut buffer) => {
                let (len, from) = match res {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error=%e, "Multicast receive failed");
                        continue;
                    }
                };

                let envelope = match Frame::<Envelope>::decode_datagram(&buffer[..len]) {
                    Ok(frame) => frame.payload.ok(),
                    Err(e) => {
                        tracing::warn!(from=%from, error=%e, "Dropping malformed datagram");
                        continue;
                    }
                };

                if let Some(envelope) = envelope {
                    if inbound.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
