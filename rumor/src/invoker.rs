//! Issuing calls to named nodes.
//!
//! A [`CallInvoker`] never touches the network. It resolves a node name,
//! builds the envelope and puts it on a queue: the inbound queue when the
//! destination is this node, the outbound queue otherwise. Callers that expect
//! a result then park on their [`PendingCall`](crate::pending::PendingCall)
//! until the router completes it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, ErrorCode, Outcome};
use crate::errors::CallError;
use crate::node::{NodeDirectory, SELF};
use crate::pending::{PendingCall, PendingCalls};
use crate::resolver::NodeResolver;
use crate::value::Value;

#[cfg(test)]
#[path = "invoker.test.rs"]
mod tests;

#[derive(Clone)]
pub struct CallInvoker {
    directory: Arc<NodeDirectory>,
    resolver: NodeResolver,
    pending: PendingCalls,
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Sender<Envelope>,
    cancellation: CancellationToken,
    call_timeout: Option<Duration>,
    evict_on_connfail: bool,
}

impl CallInvoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<NodeDirectory>,
        resolver: NodeResolver,
        pending: PendingCalls,
        outbound: mpsc::Sender<Envelope>,
        inbound: mpsc::Sender<Envelope>,
        cancellation: CancellationToken,
        call_timeout: Option<Duration>,
        evict_on_connfail: bool,
    ) -> Self {
        CallInvoker {
            directory,
            resolver,
            pending,
            outbound,
            inbound,
            cancellation,
            call_timeout,
            evict_on_connfail,
        }
    }

    /// Invoke `resource` on `node` and wait for its result.
    #[tracing::instrument(skip(self, args), fields(call_id = tracing::field::Empty))]
    pub async fn call(
        &self,
        node: &str,
        resource: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        if self.cancellation.is_cancelled() {
            return Err(CallError::Shutdown);
        }
        let destination = self.resolver.resolve(node).await?;

        let mut pending = self.pending.register();
        tracing::Span::current().record("call_id", pending.id().0);

        let envelope = Envelope::call(
            self.directory.self_node(),
            destination,
            resource,
            args,
            pending.id(),
        );
        let on_timeout = envelope.synthetic_failure(ErrorCode::TIMEOUT);
        self.enqueue(envelope).await?;

        let outcome = tokio::select! {
            _ = self.cancellation.cancelled() => return Err(CallError::Shutdown),
            outcome = self.wait_with_deadline(&mut pending, on_timeout) => outcome,
        };

        match outcome {
            Some(Outcome::Ok(value)) => Ok(value),
            Some(Outcome::Failure(code)) => {
                tracing::debug!(code=%code, "Call failed");
                if code == ErrorCode::CONNFAIL {
                    self.evict(node);
                }
                Err(CallError::Remote {
                    resource: resource.to_string(),
                    code,
                })
            }
            None => Err(CallError::Shutdown),
        }
    }

    /// Invoke `resource` on `node` without waiting for, or expecting, a result.
    ///
    /// Returns once the envelope is queued. Delivery failures are never reported.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub async fn callnr(
        &self,
        node: &str,
        resource: &str,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        if self.cancellation.is_cancelled() {
            return Err(CallError::Shutdown);
        }
        let destination = self.resolver.resolve(node).await?;
        self.send_to(destination, resource, args).await
    }

    /// `callnr` to an address that is already known, skipping resolution.
    pub async fn send_to(
        &self,
        destination: SocketAddr,
        resource: &str,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        let envelope = Envelope::call_nr(self.directory.self_node(), destination, resource, args);
        self.enqueue(envelope).await
    }

    /// Invoke `resource` on every node listening on the multicast group,
    /// including this one.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub async fn broadcast(&self, resource: &str, args: Vec<Value>) -> Result<(), CallError> {
        if self.cancellation.is_cancelled() {
            return Err(CallError::Shutdown);
        }
        let envelope = Envelope::broadcast(self.directory.self_node(), resource, args);
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| CallError::Shutdown)
    }

    /// Local envelopes go straight to the inbound queue; nothing else on this
    /// path short-circuits them, so each local call is delivered exactly once.
    async fn enqueue(&self, envelope: Envelope) -> Result<(), CallError> {
        let queue = if envelope.destination() == Some(self.directory.self_node().address) {
            tracing::trace!(resource=%envelope.resource(), "Local short-circuit");
            &self.inbound
        } else {
            &self.outbound
        };
        queue.send(envelope).await.map_err(|_| CallError::Shutdown)
    }

    async fn wait_with_deadline(
        &self,
        pending: &mut PendingCall,
        on_timeout: Option<Envelope>,
    ) -> Option<Outcome> {
        let Some(timeout) = self.call_timeout else {
            return pending.wait().await;
        };

        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(?timeout, "Call deadline expired");
                // Whichever RETURN reaches the router first completes the
                // call, the other finds no pending entry and is dropped.
                if let Some(failure) = on_timeout {
                    if self.inbound.send(failure).await.is_err() {
                        return None;
                    }
                }
                pending.wait().await
            }
        }
    }

    fn evict(&self, node: &str) {
        if !self.evict_on_connfail || node == SELF {
            return;
        }
        if self.directory.forget(node) {
            tracing::debug!(node=%node, "Evicted unreachable node from the address cache");
        }
    }
}
