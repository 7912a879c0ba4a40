//! Error types surfaced to callers of the runtime.

use crate::envelope::ErrorCode;
use crate::net::NetError;

/// Errors raised while turning a node name into an address
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unknown node '{node}' after {attempts} attempts")]
    UnknownNode { node: String, attempts: u32 },

    #[error("Node '{0}' is known but has no address")]
    AddressNotKnown(String),

    #[error("Runtime is shut down")]
    Shutdown,
}

/// Errors raised by `call`, `callnr` and `broadcast`
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The call reached a `RETURN` carrying an error code, either produced by
    /// the remote resource or synthesized locally (CONNFAIL, NOACK, TIMEOUT).
    #[error("Call to '{resource}' failed with {code}")]
    Remote { resource: String, code: ErrorCode },

    #[error("Runtime is shut down")]
    Shutdown,
}

impl CallError {
    /// The error code carried by a failed `RETURN`, if that is what this is.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            CallError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("No such event '{0}'")]
    NoSuchEvent(String),

    #[error("Event '{0}' already has a waiter")]
    AlreadyWaiting(String),

    #[error("Event call failed: {0}")]
    Call(#[from] CallError),

    #[error("Runtime is shut down")]
    Shutdown,
}

/// Errors raised when the transport fails to deliver one envelope
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("No acknowledgement: {0}")]
    NoAck(String),

    #[error("Multicast send failed: {0}")]
    Multicast(String),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

impl TransportError {
    /// The code reported to a caller whose envelope hit this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Connect(_) => ErrorCode::CONNFAIL,
            TransportError::Net(_) => ErrorCode::BADENVELOPE,
            TransportError::NoAck(_) | TransportError::Multicast(_) => ErrorCode::NOACK,
        }
    }
}

/// Errors raised while starting a runtime
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up multicast: {0}")]
    Multicast(#[source] std::io::Error),
}
