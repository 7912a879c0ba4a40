//! The router drains the inbound queue.
//!
//! Every envelope teaches the address cache where its sender lives. `RETURN`s
//! complete pending calls, everything else is dispatched to a subscribed
//! event proxy, a built-in resource or a registered [`Resource`](crate::resource::Resource).
//!
//! The router never waits on the outbound queue itself: resource invocations
//! run on their own tasks and built-in replies are queued without blocking,
//! so a full outbound queue cannot stall the completion of pending calls.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, ErrorCode, Kind, Outcome};
use crate::events::{EVENT_SUBSCRIBE, EventBus};
use crate::invoker::CallInvoker;
use crate::node::NodeDirectory;
use crate::pending::PendingCalls;
use crate::resolver::{NODE_QUERY, NODE_UPDATE};
use crate::resource::{Invocation, ResourceRegistry};
use crate::value::Value;

/// Returned by built-in resources called with arguments of the wrong shape.
const BADARGS: &str = "BADARGS";

#[cfg(test)]
#[path = "router.test.rs"]
mod tests;

pub(crate) struct Router {
    directory: Arc<NodeDirectory>,
    pending: PendingCalls,
    registry: ResourceRegistry,
    events: EventBus,
    invoker: CallInvoker,
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<Envelope>,
    cancellation: CancellationToken,
    handlers: JoinSet<()>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        directory: Arc<NodeDirectory>,
        pending: PendingCalls,
        registry: ResourceRegistry,
        events: EventBus,
        invoker: CallInvoker,
        outbound: mpsc::Sender<Envelope>,
        inbound: mpsc::Receiver<Envelope>,
        cancellation: CancellationToken,
    ) -> Self {
        Router {
            directory,
            pending,
            registry,
            events,
            invoker,
            outbound,
            inbound,
            cancellation,
            handlers: JoinSet::new(),
        }
    }

    #[tracing::instrument(name = "router", skip(self), fields(node = %self.directory.self_node().name))]
    pub(crate) async fn run(mut self) {
        tracing::debug!("Router started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    break;
                },
                Some(res) = self.handlers.join_next(), if !self.handlers.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            tracing::error!(error=%e, "Resource handler panicked");
                        }
                    }
                },
                envelope = self.inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.route(envelope),
                        None => break,
                    }
                }
            }
        }
        self.handlers.shutdown().await;
        tracing::debug!("Router stopped");
    }

    fn route(&mut self, envelope: Envelope) {
        self.directory
            .record_address(envelope.source_node(), envelope.source_address());

        match envelope.kind() {
            Kind::Return => {
                let resource = envelope.resource().to_string();
                match envelope.into_return() {
                    Some((call_id, outcome)) => {
                        if !self.pending.complete(call_id, outcome) {
                            tracing::debug!(%call_id, resource=%resource, "Dropping RETURN with no pending call");
                        }
                    }
                    None => {
                        tracing::warn!(resource=%resource, "Dropping RETURN without call id or outcome");
                    }
                }
            }
            Kind::Call | Kind::Broadcast => self.handle_call(envelope),
        }
    }

    fn handle_call(&mut self, envelope: Envelope) {
        let first = envelope.args().first().cloned().unwrap_or_default();
        if self.events.deliver(envelope.resource(), first) {
            tracing::trace!(key=%envelope.resource(), "Event delivered");
            self.reply(&envelope, Outcome::Ok(Value::Null));
            return;
        }

        let outcome = match envelope.resource() {
            NODE_QUERY => Some(self.node_query(&envelope)),
            NODE_UPDATE => Some(self.node_update(&envelope)),
            EVENT_SUBSCRIBE => Some(self.event_subscribe(&envelope)),
            _ => None,
        };
        match outcome {
            Some(outcome) => self.reply(&envelope, outcome),
            None => self.invoke(envelope),
        }
    }

    /// Answer a query for our own name by calling `Node_Update` on the querier.
    fn node_query(&mut self, envelope: &Envelope) -> Outcome {
        let self_node = self.directory.self_node();
        let Some(queried) = envelope.args().first().and_then(Value::as_str) else {
            return Outcome::Failure(ErrorCode::new(BADARGS));
        };
        if queried != self_node.name {
            return Outcome::Ok(Value::Null);
        }

        let querier = envelope
            .args()
            .get(1)
            .and_then(Value::as_str)
            .and_then(|addr| addr.parse::<SocketAddr>().ok())
            .unwrap_or(envelope.source_address());

        tracing::debug!(querier=%querier, "Answering node query");
        let invoker = self.invoker.clone();
        let args = vec![
            Value::from(self_node.name.as_str()),
            Value::from(self_node.address.to_string()),
        ];
        self.handlers.spawn(async move {
            if let Err(e) = invoker.send_to(querier, NODE_UPDATE, args).await {
                tracing::debug!(error=%e, "Failed to answer node query");
            }
        });
        Outcome::Ok(Value::Null)
    }

    fn node_update(&self, envelope: &Envelope) -> Outcome {
        let args = envelope.args();
        let name = args.first().and_then(Value::as_str);
        let addr = args
            .get(1)
            .and_then(Value::as_str)
            .and_then(|addr| addr.parse::<SocketAddr>().ok());
        match (name, addr) {
            (Some(name), Some(addr)) => {
                self.directory.record_address(name, addr);
                Outcome::Ok(Value::Null)
            }
            _ => {
                tracing::warn!(from=%envelope.source_node(), "Malformed Node_Update");
                Outcome::Failure(ErrorCode::new(BADARGS))
            }
        }
    }

    fn event_subscribe(&self, envelope: &Envelope) -> Outcome {
        let args = envelope.args();
        match (
            args.first().and_then(Value::as_str),
            args.get(1).and_then(Value::as_str),
        ) {
            (Some(event), Some(subscriber)) => {
                self.events.add_subscriber(event, subscriber);
                Outcome::Ok(Value::Null)
            }
            _ => Outcome::Failure(ErrorCode::new(BADARGS)),
        }
    }

    fn invoke(&mut self, envelope: Envelope) {
        let Some(resource) = self.registry.lookup(envelope.resource()) else {
            tracing::debug!(
                resource=%envelope.resource(),
                from=%envelope.source_node(),
                "No such resource"
            );
            self.reply(&envelope, Outcome::Failure(ErrorCode::NORESOURCE));
            return;
        };

        let responder = self.directory.self_node().clone();
        let outbound = self.outbound.clone();
        self.handlers.spawn(async move {
            let invocation = Invocation {
                source: envelope.source_node().to_string(),
                args: envelope.args().to_vec(),
            };
            let outcome = Outcome::from(resource.invoke(invocation).await);
            if let Some(reply) = envelope.reply(&responder, outcome) {
                if outbound.send(reply).await.is_err() {
                    tracing::debug!("Outbound queue closed, dropping reply");
                }
            }
        });
    }

    /// Queue the reply to `envelope`. When the outbound queue is full the
    /// send is deferred to a handler task, as long as fewer handlers than
    /// the queue capacity are outstanding. Past that the reply is dropped
    /// and the caller runs into its deadline.
    fn reply(&mut self, envelope: &Envelope, outcome: Outcome) {
        let Some(reply) = envelope.reply(self.directory.self_node(), outcome) else {
            return;
        };
        match self.outbound.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Outbound queue closed, dropping reply");
            }
            Err(TrySendError::Full(reply)) => {
                if self.handlers.len() >= self.outbound.max_capacity() {
                    tracing::warn!(
                        resource=%envelope.resource(),
                        to=%envelope.source_node(),
                        "Outbound queue saturated, dropping reply"
                    );
                    return;
                }
                let outbound = self.outbound.clone();
                self.handlers.spawn(async move {
                    if outbound.send(reply).await.is_err() {
                        tracing::debug!("Outbound queue closed, dropping reply");
                    }
                });
            }
        }
    }
}
