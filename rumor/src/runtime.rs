//! The [`Runtime`] owns one node: its address cache, queues, pending calls,
//! resources and events, plus the tasks that move envelopes between them.
//!
//! ```text
//!   call/callnr ─► outbound queue ─► OutboundDispatcher ─► Transport ─► network
//!        │                                  │
//!        └── local ──► inbound queue ◄──────┴── synthetic RETURNs
//!                          ▲   │
//!   network ─► listener ───┘   └─► Router ─► pending calls / events / resources
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::OutboundDispatcher;
use crate::envelope::{Envelope, ErrorCode};
use crate::errors::{CallError, EventError, ResolveError, RuntimeError};
use crate::events::EventBus;
use crate::invoker::CallInvoker;
use crate::listener;
use crate::node::{Node, NodeDirectory};
use crate::pending::PendingCalls;
use crate::resolver::NodeResolver;
use crate::resource::{Invocation, Resource, ResourceRegistry};
use crate::router::Router;
use crate::transport::{self, TcpTransport, Transport};
use crate::value::Value;

/// Handle to a running node. Cloning is cheap; all clones share the node.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    directory: Arc<NodeDirectory>,
    resolver: NodeResolver,
    invoker: CallInvoker,
    pending: PendingCalls,
    registry: ResourceRegistry,
    events: EventBus,
    cancellation: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a node on real sockets: a TCP listener on `config.bind_addr`
    /// and, when configured, a multicast group membership.
    pub async fn bind(config: Config) -> Result<Runtime, RuntimeError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| RuntimeError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local = listener.local_addr().map_err(|source| RuntimeError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        let self_address = advertised_address(&config, local);

        let tcp = TcpTransport::new(config.ack_timeout, config.multicast.as_ref()).await?;
        let multicast = config
            .multicast
            .as_ref()
            .map(transport::bind_multicast_receiver)
            .transpose()?;

        let (runtime, inbound) = Runtime::start(config, self_address, Arc::new(tcp));
        let cancellation = runtime.inner.cancellation.clone();

        runtime.spawn(listener::serve_tcp(
            listener,
            inbound.clone(),
            runtime.inner.config.ack_timeout,
            cancellation.clone(),
        ));
        if let Some(socket) = multicast {
            runtime.spawn(listener::serve_multicast(socket, inbound, cancellation));
        }

        Ok(runtime)
    }

    /// Wire up every component around `transport` and spawn the dispatcher
    /// and router. Returns the sender side of the inbound queue so the caller
    /// can attach listeners.
    pub(crate) fn start(
        config: Config,
        self_address: SocketAddr,
        transport: Arc<dyn Transport>,
    ) -> (Runtime, mpsc::Sender<Envelope>) {
        let self_node = Node::new(config.name.clone(), self_address);
        let directory = Arc::new(NodeDirectory::new(self_node));

        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let cancellation = CancellationToken::new();

        let pending = PendingCalls::new();
        let resolver = NodeResolver::new(
            directory.clone(),
            outbound_tx.clone(),
            config.resolve_attempts(),
            config.resolve_interval,
        );
        let invoker = CallInvoker::new(
            directory.clone(),
            resolver.clone(),
            pending.clone(),
            outbound_tx.clone(),
            inbound_tx.clone(),
            cancellation.clone(),
            config.call_timeout,
            config.evict_on_connfail,
        );
        let registry = ResourceRegistry::new();
        let events = EventBus::new(directory.clone(), invoker.clone());

        let dispatcher = OutboundDispatcher::new(
            transport,
            self_address,
            outbound_rx,
            inbound_tx.clone(),
            cancellation.clone(),
        );
        let router = Router::new(
            directory.clone(),
            pending.clone(),
            registry.clone(),
            events.clone(),
            invoker.clone(),
            outbound_tx,
            inbound_rx,
            cancellation.clone(),
        );

        let tasks = vec![tokio::spawn(dispatcher.run()), tokio::spawn(router.run())];
        tracing::info!(node=%config.name, addr=%self_address, "Runtime started");

        let runtime = Runtime {
            inner: Arc::new(Inner {
                config,
                directory,
                resolver,
                invoker,
                pending,
                registry,
                events,
                cancellation,
                tasks: Mutex::new(tasks),
            }),
        };
        (runtime, inbound_tx)
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.lock().push(tokio::spawn(task));
    }

    pub fn name(&self) -> &str {
        &self.inner.directory.self_node().name
    }

    pub fn self_node(&self) -> &Node {
        self.inner.directory.self_node()
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.directory.self_node().address
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.inner.directory
    }

    /// Seed the address cache, e.g. for nodes outside the multicast segment.
    pub fn learn(&self, name: &str, address: SocketAddr) {
        self.inner.directory.record_address(name, address);
    }

    /// Number of calls currently waiting for a result.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.in_flight()
    }

    pub async fn resolve(&self, node: &str) -> Result<SocketAddr, ResolveError> {
        self.inner.resolver.resolve(node).await
    }

    pub async fn call(
        &self,
        node: &str,
        resource: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        self.inner.invoker.call(node, resource, args).await
    }

    pub async fn callnr(
        &self,
        node: &str,
        resource: &str,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        self.inner.invoker.callnr(node, resource, args).await
    }

    pub async fn broadcast(&self, resource: &str, args: Vec<Value>) -> Result<(), CallError> {
        self.inner.invoker.broadcast(resource, args).await
    }

    pub fn register(&self, name: impl Into<String>, resource: impl Resource) {
        self.inner.registry.register(name, resource);
    }

    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ErrorCode>> + Send + 'static,
    {
        self.inner.registry.register_fn(name, f);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.registry.unregister(name)
    }

    pub async fn subscribe(&self, node: &str, event: &str) -> Result<(), EventError> {
        self.inner.events.subscribe(node, event).await
    }

    pub async fn waitfor(&self, node: &str, event: &str) -> Result<Value, EventError> {
        self.inner.events.waitfor(node, event).await
    }

    pub async fn fire(&self, event: &str, value: impl Into<Value>) -> Result<usize, EventError> {
        self.inner.events.fire(event, value.into()).await
    }

    pub fn declare(&self, event: &str) {
        self.inner.events.declare(event);
    }

    pub fn subscribers(&self, event: &str) -> Vec<String> {
        self.inner.events.subscribers(event)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Stop every task of this node and wait for them to finish. Listening
    /// sockets are closed; parked calls and event waiters fail with `Shutdown`.
    pub async fn shutdown(&self) {
        self.inner.cancellation.cancel();
        self.inner.events.close();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error=%e, "Runtime task panicked");
                }
            }
        }
        tracing::info!(node=%self.name(), "Runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", self.self_node())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn advertised_address(config: &Config, local: SocketAddr) -> SocketAddr {
    if let Some(addr) = config.advertise_addr {
        return addr;
    }
    if local.ip().is_unspecified() {
        SocketAddr::new(transport::guess_reachable_ip().into(), local.port())
    } else {
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_address() {
        let bound = SocketAddr::from(([127, 0, 0, 1], 4000));
        assert_eq!(advertised_address(&Config::new("A"), bound), bound);

        let advertised = SocketAddr::from(([192, 168, 1, 5], 9000));
        let config = Config::new("A").with_advertise_addr(advertised);
        assert_eq!(advertised_address(&config, bound), advertised);

        let unspecified = SocketAddr::from(([0, 0, 0, 0], 4000));
        let guessed = advertised_address(&Config::new("A"), unspecified);
        assert_eq!(guessed.port(), 4000);
        assert!(!guessed.ip().is_unspecified());
    }
}
