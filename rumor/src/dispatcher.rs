//! The outbound dispatcher is the only task that sends on the network.
//!
//! It drains the outbound queue in FIFO order. Each unicast exchange runs on
//! its own child task so one slow destination does not hold up the rest of the
//! queue; as a consequence replies may complete in any order and are matched
//! by call id only.
//!
//! ```text
//!   outbound queue ──► dispatch ──┬─ dest == self ──────────► inbound queue
//!                                 ├─ CALL/RETURN ─► deliver ─┬─ ok
//!                                 │                          └─ CONNFAIL/NOACK ─► synthetic RETURN ─► inbound queue
//!                                 └─ BROADCAST ──► multicast (fire and forget)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, ErrorCode, Kind};
use crate::net::Frame;
use crate::transport::Transport;

#[cfg(test)]
#[path = "dispatcher.test.rs"]
mod tests;

pub struct OutboundDispatcher {
    transport: Arc<dyn Transport>,
    self_address: SocketAddr,
    outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<Envelope>,
    cancellation: CancellationToken,
    exchanges: JoinSet<()>,
}

impl OutboundDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        self_address: SocketAddr,
        outbound: mpsc::Receiver<Envelope>,
        inbound: mpsc::Sender<Envelope>,
        cancellation: CancellationToken,
    ) -> Self {
        OutboundDispatcher {
            transport,
            self_address,
            outbound,
            inbound,
            cancellation,
            exchanges: JoinSet::new(),
        }
    }

    #[tracing::instrument(name = "dispatcher", skip(self), fields(addr = %self.self_address))]
    pub async fn run(mut self) {
        tracing::debug!("Dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    break;
                },
                Some(res) = self.exchanges.join_next(), if !self.exchanges.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            tracing::error!(error=%e, "Exchange task panicked");
                        }
                    }
                },
                envelope = self.outbound.recv() => {
                    match envelope {
                        Some(envelope) => self.dispatch(envelope).await,
                        None => break,
                    }
                }
            }
        }
        self.exchanges.shutdown().await;
        tracing::debug!("Dispatcher stopped");
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        match envelope.kind() {
            Kind::Broadcast => self.broadcast(envelope),
            Kind::Call | Kind::Return => {
                let Some(destination) = envelope.destination() else {
                    tracing::warn!(
                        resource=%envelope.resource(),
                        "Dropping unicast envelope without a destination"
                    );
                    return;
                };

                if destination == self.self_address {
                    tracing::trace!(resource=%envelope.resource(), "Local delivery");
                    if self.inbound.send(envelope).await.is_err() {
                        tracing::debug!("Inbound queue closed, dropping local envelope");
                    }
                    return;
                }

                self.unicast(destination, envelope);
            }
        }
    }

    fn unicast(&mut self, destination: SocketAddr, envelope: Envelope) {
        let transport = self.transport.clone();
        let inbound = self.inbound.clone();
        self.exchanges.spawn(async move {
            let frame = match Frame::ok(envelope.clone()).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error=%e, resource=%envelope.resource(), "Failed to encode envelope");
                    report_failure(&inbound, &envelope, ErrorCode::BADENVELOPE).await;
                    return;
                }
            };

            match transport.deliver(destination, frame).await {
                Ok(()) => {
                    tracing::trace!(
                        addr=%destination,
                        call_id=?envelope.call_id(),
                        "Delivered"
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        addr=%destination,
                        call_id=?envelope.call_id(),
                        resource=%envelope.resource(),
                        error=%e,
                        "Delivery failed"
                    );
                    report_failure(&inbound, &envelope, e.code()).await;
                }
            }
        });
    }

    fn broadcast(&mut self, envelope: Envelope) {
        let transport = self.transport.clone();
        self.exchanges.spawn(async move {
            let frame = match Frame::ok(envelope).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error=%e, "Failed to encode broadcast");
                    return;
                }
            };
            if let Err(e) = transport.multicast(frame).await {
                tracing::debug!(error=%e, "Broadcast failed");
            }
        });
    }
}

/// Wake the caller of a failed `CALL` with a synthetic `RETURN`. Failures of
/// fire-and-forget envelopes are absorbed here.
async fn report_failure(inbound: &mpsc::Sender<Envelope>, envelope: &Envelope, code: ErrorCode) {
    let Some(failure) = envelope.synthetic_failure(code) else {
        return;
    };
    if inbound.send(failure).await.is_err() {
        tracing::debug!("Inbound queue closed, dropping synthetic failure");
    }
}
