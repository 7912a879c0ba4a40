//! Correlation of in-flight calls with their `RETURN` envelopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::envelope::{CallId, Outcome};

/// The table of calls waiting for a reply.
///
/// Each entry is a single-slot result holder: it is filled at most once and
/// removed the moment it is filled, so a call is never resolved twice and a
/// late duplicate finds nothing to complete.
#[derive(Clone, Default)]
pub struct PendingCalls {
    next_id: Arc<AtomicU64>,
    waiting: Arc<Mutex<HashMap<CallId, oneshot::Sender<Outcome>>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh call id and park a waiter on it.
    pub fn register(&self) -> PendingCall {
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);
        PendingCall {
            id,
            rx,
            calls: self.clone(),
        }
    }

    /// Hand `outcome` to the waiter for `id`. Returns false when nobody is
    /// waiting, e.g. the call already completed or gave up.
    pub fn complete(&self, id: CallId, outcome: Outcome) -> bool {
        let Some(tx) = self.waiting.lock().remove(&id) else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    pub fn in_flight(&self) -> usize {
        self.waiting.lock().len()
    }

    fn abandon(&self, id: CallId) {
        self.waiting.lock().remove(&id);
    }
}

/// A registered call waiting for its result. Dropping it removes the entry.
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<Outcome>,
    calls: PendingCalls,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the outcome. `None` means the table was torn down without
    /// ever completing this call.
    pub async fn wait(&mut self) -> Option<Outcome> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.abandon(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ErrorCode;
    use crate::value::Value;

    #[tokio::test]
    async fn test_each_outcome_reaches_its_own_waiter() {
        let calls = PendingCalls::new();
        let mut first = calls.register();
        let mut second = calls.register();
        assert_ne!(first.id(), second.id());

        assert!(calls.complete(second.id(), Outcome::Ok(Value::from(2))));
        assert!(calls.complete(first.id(), Outcome::Ok(Value::from(1))));

        assert_eq!(first.wait().await, Some(Outcome::Ok(Value::from(1))));
        assert_eq!(second.wait().await, Some(Outcome::Ok(Value::from(2))));
    }

    #[test]
    fn test_second_completion_is_dropped() {
        let calls = PendingCalls::new();
        let call = calls.register();
        assert!(calls.complete(call.id(), Outcome::Failure(ErrorCode::TIMEOUT)));
        assert!(!calls.complete(call.id(), Outcome::Ok(Value::Null)));
    }

    #[test]
    fn test_dropping_a_call_removes_it() {
        let calls = PendingCalls::new();
        let call = calls.register();
        let id = call.id();
        assert_eq!(calls.in_flight(), 1);
        drop(call);
        assert_eq!(calls.in_flight(), 0);
        assert!(!calls.complete(id, Outcome::Ok(Value::Null)));
    }
}
