//! Node name resolution.
//!
//! Resolution is a bounded polling loop over the address cache. Each attempt
//! broadcasts a `Node_Query` and then waits up to the configured interval for
//! some inbound envelope (normally the queried node's `Node_Update`) to fill
//! the cache. The wait ends early when the cache changes, but the number of
//! queries sent is always exactly the configured attempt count when nobody
//! answers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::errors::ResolveError;
use crate::node::{NodeDirectory, SELF};
use crate::value::Value;

/// Resource name of the broadcast query for a node's address.
pub const NODE_QUERY: &str = "Node_Query";
/// Resource name a queried node calls back to report its address.
pub const NODE_UPDATE: &str = "Node_Update";

#[cfg(test)]
#[path = "resolver.test.rs"]
mod tests;

#[derive(Clone)]
pub struct NodeResolver {
    directory: Arc<NodeDirectory>,
    outbound: mpsc::Sender<Envelope>,
    attempts: u32,
    interval: Duration,
}

impl NodeResolver {
    pub fn new(
        directory: Arc<NodeDirectory>,
        outbound: mpsc::Sender<Envelope>,
        attempts: u32,
        interval: Duration,
    ) -> Self {
        NodeResolver {
            directory,
            outbound,
            attempts: attempts.max(1),
            interval,
        }
    }

    #[tracing::instrument(skip(self), fields(self_node = %self.directory.self_node().name))]
    pub async fn resolve(&self, node: &str) -> Result<SocketAddr, ResolveError> {
        if node == SELF {
            return Ok(self.directory.self_node().address);
        }

        for attempt in 1..=self.attempts {
            if let Some(Some(addr)) = self.directory.cached_address(node) {
                return Ok(addr);
            }

            tracing::debug!(attempt, "Querying network for node");
            self.query(node).await?;

            if let Some(addr) = self.wait_for(node, self.interval).await {
                return Ok(addr);
            }
        }

        match self.directory.cached_address(node) {
            Some(Some(addr)) => Ok(addr),
            Some(None) => Err(ResolveError::AddressNotKnown(node.to_string())),
            None => {
                tracing::debug!(attempts = self.attempts, "Node did not answer");
                Err(ResolveError::UnknownNode {
                    node: node.to_string(),
                    attempts: self.attempts,
                })
            }
        }
    }

    async fn query(&self, node: &str) -> Result<(), ResolveError> {
        let self_node = self.directory.self_node();
        let query = Envelope::broadcast(
            self_node,
            NODE_QUERY,
            vec![
                Value::from(node),
                Value::from(self_node.address.to_string()),
            ],
        );
        self.outbound
            .send(query)
            .await
            .map_err(|_| ResolveError::Shutdown)
    }

    /// Wait until `node` has a usable cached address or `interval` elapses.
    async fn wait_for(&self, node: &str, interval: Duration) -> Option<SocketAddr> {
        let deadline = Instant::now() + interval;
        loop {
            let changed = self.directory.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(Some(addr)) = self.directory.cached_address(node) {
                return Some(addr);
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }
}
