//! Helpers for testing several nodes on one [`MemoryNetwork`].
//!
//! ```ignore
//! use crate::test_utils::prelude::*;
//!
//! #[test_log::test(tokio::test)]
//! async fn test_echo() {
//!     let test = NodeTestHarness::new();
//!     let a = test.join("A");
//!     let b = test.join_with_echo("B");
//!
//!     let reply = a.call("B", "echo", vec!["hi".into()]).await.unwrap();
//!     assert_eq!(reply, Value::from("hi"));
//! }
//! ```

use std::time::Duration;

use crate::prelude::*;

/// Timings short enough to keep failure paths fast in tests.
pub fn test_config(name: &str) -> Config {
    Config::new(name)
        .with_multicast(None)
        .with_resolve(2, Duration::from_millis(50))
        .with_ack_timeout(Duration::from_millis(100))
        .with_call_timeout(Some(Duration::from_secs(2)))
}

/// A set of nodes sharing one in-memory network.
pub struct NodeTestHarness {
    pub network: MemoryNetwork,
}

impl NodeTestHarness {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
        }
    }

    pub fn join(&self, name: &str) -> Runtime {
        self.network.join(test_config(name))
    }

    pub fn join_with(&self, config: Config) -> Runtime {
        self.network.join(config)
    }

    /// Join a node exposing an `echo` resource that returns its first argument.
    pub fn join_with_echo(&self, name: &str) -> Runtime {
        let node = self.join(name);
        node.register_fn("echo", |inv: Invocation| async move {
            Ok(inv.args.into_iter().next().unwrap_or_default())
        });
        node
    }

    /// Make every node's address known to every other node.
    pub fn introduce(&self, nodes: &[&Runtime]) {
        for a in nodes {
            for b in nodes {
                a.learn(b.name(), b.address());
            }
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for_condition<F>(condition: F, timeout: Duration) -> Result<(), &'static str>
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if condition() {
        Ok(())
    } else {
        Err("Timed out waiting for condition")
    }
}

pub mod prelude {
    pub use super::{NodeTestHarness, test_config, wait_for_condition};
    pub use crate::prelude::*;
}
