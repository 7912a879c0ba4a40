//! Commonly used types.
//!
//! Import this module to get a runtime running and call other nodes.

pub use super::config::{Config, DEFAULT_MULTICAST_GROUP, MulticastConfig};
pub use super::envelope::{CallId, Envelope, ErrorCode, Kind, Outcome};
pub use super::errors::{
    CallError,      // Raised by call, callnr and broadcast
    EventError,     // Raised by subscribe, waitfor and fire
    ResolveError,   // Raised when a node name has no address
    RuntimeError,   // Raised while starting a runtime
    TransportError, // Raised by a transport for one delivery
};
pub use super::events::{EVENT_SUBSCRIBE, proxy_key};
pub use super::memory::{MEMORY_PORT, MemoryNetwork};
pub use super::net::NetError;
pub use super::node::{Node, NodeDirectory, SELF};
pub use super::resolver::{NODE_QUERY, NODE_UPDATE};
pub use super::resource::{Invocation, Resource};
pub use super::runtime::Runtime;
pub use super::value::Value;
pub use async_trait::async_trait;
