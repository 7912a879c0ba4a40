//! Node-addressed remote invocation.
//!
//! Every process runs one [`Runtime`](prelude::Runtime) under a unique node
//! name. Nodes call named resources on each other by node name, find each
//! other through multicast queries and exchange events.
//!
//! ```no_run
//! use rumor::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Runtime::bind(Config::new("A")).await?;
//! node.register_fn("echo", |inv: Invocation| async move {
//!     Ok(inv.args.into_iter().next().unwrap_or_default())
//! });
//!
//! let reply = node.call("B", "echo", vec!["hi".into()]).await?;
//! assert_eq!(reply, Value::from("hi"));
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod envelope;
mod errors;
mod events;
mod invoker;
mod listener;
mod memory;
mod net;
mod node;
mod pending;
pub mod prelude;
mod resolver;
mod resource;
mod router;
mod runtime;
#[cfg(test)]
mod test_utils;
mod transport;
mod value;
