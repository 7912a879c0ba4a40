//! The envelope is the unit of communication between nodes.
//!
//! Every request, response and broadcast travels as an [`Envelope`]. Envelopes
//! are immutable once built; the constructors below are the only way to make one
//! and each enforces the field combinations that are legal for its [`Kind`].

use std::borrow::Cow;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::value::Value;

/// Correlation token pairing a `CALL` with its `RETURN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Call,
    Return,
    Broadcast,
}

/// An error code carried by a failed `RETURN`.
///
/// The crate produces a handful of codes itself; resources are free to return
/// any other code and it is carried to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(Cow<'static, str>);

impl ErrorCode {
    /// The destination refused or could not be reached.
    pub const CONNFAIL: ErrorCode = ErrorCode(Cow::Borrowed("CONNFAIL"));
    /// The destination accepted the connection but never acknowledged the envelope.
    pub const NOACK: ErrorCode = ErrorCode(Cow::Borrowed("NOACK"));
    /// The per-call deadline expired before a reply arrived.
    pub const TIMEOUT: ErrorCode = ErrorCode(Cow::Borrowed("TIMEOUT"));
    /// The destination has no resource registered under the requested name.
    pub const NORESOURCE: ErrorCode = ErrorCode(Cow::Borrowed("NORESOURCE"));
    /// The envelope could not be encoded for transmission.
    pub const BADENVELOPE: ErrorCode = ErrorCode(Cow::Borrowed("BADENVELOPE"));

    pub fn new(code: impl Into<String>) -> Self {
        ErrorCode(Cow::Owned(code.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        ErrorCode::new(code)
    }
}

/// Result status of a `RETURN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Ok(Value),
    Failure(ErrorCode),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn into_result(self) -> Result<Value, ErrorCode> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Failure(code) => Err(code),
        }
    }
}

impl From<Result<Value, ErrorCode>> for Outcome {
    fn from(result: Result<Value, ErrorCode>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(code) => Outcome::Failure(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    kind: Kind,
    source_node: String,
    source_address: SocketAddr,
    destination: Option<SocketAddr>,
    resource: String,
    args: Vec<Value>,
    no_return: bool,
    call_id: Option<CallId>,
    outcome: Option<Outcome>,
}

impl Envelope {
    /// A `CALL` whose caller waits for the correlated `RETURN`.
    pub fn call(
        source: &Node,
        destination: SocketAddr,
        resource: impl Into<String>,
        args: Vec<Value>,
        call_id: CallId,
    ) -> Self {
        Envelope {
            kind: Kind::Call,
            source_node: source.name.clone(),
            source_address: source.address,
            destination: Some(destination),
            resource: resource.into(),
            args,
            no_return: false,
            call_id: Some(call_id),
            outcome: None,
        }
    }

    /// A `CALL` with `noReturnExpected` set. It carries no call id since there
    /// is nothing to correlate.
    pub fn call_nr(
        source: &Node,
        destination: SocketAddr,
        resource: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Envelope {
            kind: Kind::Call,
            source_node: source.name.clone(),
            source_address: source.address,
            destination: Some(destination),
            resource: resource.into(),
            args,
            no_return: true,
            call_id: None,
            outcome: None,
        }
    }

    pub fn broadcast(source: &Node, resource: impl Into<String>, args: Vec<Value>) -> Self {
        Envelope {
            kind: Kind::Broadcast,
            source_node: source.name.clone(),
            source_address: source.address,
            destination: None,
            resource: resource.into(),
            args,
            no_return: true,
            call_id: None,
            outcome: None,
        }
    }

    /// Build the `RETURN` answering this envelope, sent by `responder`.
    ///
    /// Returns `None` when this envelope does not expect a reply.
    pub fn reply(&self, responder: &Node, outcome: Outcome) -> Option<Envelope> {
        if !self.expects_return() {
            return None;
        }
        Some(Envelope {
            kind: Kind::Return,
            source_node: responder.name.clone(),
            source_address: responder.address,
            destination: Some(self.source_address),
            resource: self.resource.clone(),
            args: Vec::new(),
            no_return: true,
            call_id: self.call_id,
            outcome: Some(outcome),
        })
    }

    /// Build a locally synthesized failed `RETURN` for a call that never got an
    /// answer from the network. The result is addressed back to the caller and
    /// names the caller as its source, so it never pollutes the address cache.
    pub fn synthetic_failure(&self, code: ErrorCode) -> Option<Envelope> {
        if !self.expects_return() {
            return None;
        }
        Some(Envelope {
            kind: Kind::Return,
            source_node: self.source_node.clone(),
            source_address: self.source_address,
            destination: Some(self.source_address),
            resource: self.resource.clone(),
            args: Vec::new(),
            no_return: true,
            call_id: self.call_id,
            outcome: Some(Outcome::Failure(code)),
        })
    }

    /// True for a `CALL` that has a caller parked on its result.
    pub fn expects_return(&self) -> bool {
        self.kind == Kind::Call && !self.no_return && self.call_id.is_some()
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn source_node(&self) -> &str {
        &self.source_node
    }

    pub fn source_address(&self) -> SocketAddr {
        self.source_address
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn no_return(&self) -> bool {
        self.no_return
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Split a `RETURN` into its correlation id and outcome.
    pub fn into_return(self) -> Option<(CallId, Outcome)> {
        match (self.kind, self.call_id, self.outcome) {
            (Kind::Return, Some(id), Some(outcome)) => Some((id, outcome)),
            _ => None,
        }
    }

    /// Take the arguments, leaving the envelope's other fields readable.
    pub fn into_args(self) -> Vec<Value> {
        self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, port: u16) -> Node {
        Node::new(name, SocketAddr::from(([10, 0, 0, 1], port)))
    }

    #[test]
    fn test_reply_targets_caller() {
        let a = node("A", 9000);
        let b = node("B", 9001);
        let call = Envelope::call(&a, b.address, "echo", vec!["hi".into()], CallId(7));
        let reply = call
            .reply(&b, Outcome::Ok("hi".into()))
            .expect("call expects a reply");

        assert_eq!(reply.kind(), Kind::Return);
        assert_eq!(reply.destination(), Some(a.address));
        assert_eq!(reply.source_node(), "B");
        assert_eq!(reply.into_return(), Some((CallId(7), Outcome::Ok("hi".into()))));
    }

    #[test]
    fn test_no_return_envelopes_never_reply() {
        let a = node("A", 9000);
        let nr = Envelope::call_nr(&a, a.address, "log", vec![]);
        assert!(nr.call_id().is_none());
        assert!(nr.reply(&a, Outcome::Ok(Value::Null)).is_none());
        assert!(nr.synthetic_failure(ErrorCode::CONNFAIL).is_none());

        let bc = Envelope::broadcast(&a, "Node_Query", vec![]);
        assert!(bc.destination().is_none());
        assert!(bc.no_return());
        assert!(bc.reply(&a, Outcome::Ok(Value::Null)).is_none());
    }

    #[test]
    fn test_synthetic_failure_names_the_caller() {
        let a = node("A", 9000);
        let b = node("B", 9001);
        let call = Envelope::call(&a, b.address, "echo", vec![], CallId(1));
        let failure = call.synthetic_failure(ErrorCode::CONNFAIL).unwrap();
        assert_eq!(failure.source_node(), "A");
        assert_eq!(failure.source_address(), a.address);
        assert_eq!(
            failure.into_return(),
            Some((CallId(1), Outcome::Failure(ErrorCode::CONNFAIL)))
        );
    }

    #[test]
    fn test_error_code_constants_compare_with_owned() {
        assert_eq!(ErrorCode::CONNFAIL, ErrorCode::new("CONNFAIL"));
        assert_eq!(ErrorCode::from("NOACK").as_str(), "NOACK");
    }
}
