//! Cross-node events.
//!
//! A node that wants to hear about `event` on node `B` keeps a local proxy
//! keyed `"B:event"` and registers itself with `B` through the
//! `Event_Subscribe` resource. When `B` fires the event it calls the resource
//! named after that key on every subscriber, and the subscriber's router
//! drops the value into the proxy's slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};

use crate::errors::{CallError, EventError};
use crate::invoker::CallInvoker;
use crate::node::{NodeDirectory, SELF};
use crate::value::Value;

/// Resource a node calls on the event owner to register as a subscriber.
pub const EVENT_SUBSCRIBE: &str = "Event_Subscribe";

#[cfg(test)]
#[path = "events.test.rs"]
mod tests;

/// The resource name a fired event is delivered to on each subscriber.
pub fn proxy_key(node: &str, event: &str) -> String {
    format!("{node}:{event}")
}

/// Single-slot holder for the latest value of a remote event.
enum Slot {
    Empty,
    Waiting(oneshot::Sender<Value>),
    Ready(Value),
}

/// Result of the `Event_Subscribe` call, published once it is known.
type Registered = Option<Result<(), EventError>>;

enum Registration {
    /// The first `subscribe` is still sending `Event_Subscribe`. Later
    /// subscribers wait on the channel for its outcome.
    Pending(watch::Receiver<Registered>),
    Done,
}

struct Proxy {
    slot: Slot,
    registration: Registration,
}

impl Proxy {
    fn pending() -> (Proxy, watch::Sender<Registered>) {
        let (tx, rx) = watch::channel(None);
        let proxy = Proxy {
            slot: Slot::Empty,
            registration: Registration::Pending(rx),
        };
        (proxy, tx)
    }
}

/// What a `subscribe` call has to do after inspecting the proxy table.
enum Step {
    Register(watch::Sender<Registered>),
    Follow(watch::Receiver<Registered>),
}

#[derive(Clone)]
pub struct EventBus {
    directory: Arc<NodeDirectory>,
    invoker: CallInvoker,
    proxies: Arc<Mutex<HashMap<String, Proxy>>>,
    registrations: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl EventBus {
    pub fn new(directory: Arc<NodeDirectory>, invoker: CallInvoker) -> Self {
        EventBus {
            directory,
            invoker,
            proxies: Arc::new(Mutex::new(HashMap::new())),
            registrations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register interest in `event` on `node`. Subscribing twice is a no-op.
    ///
    /// While a registration is in flight, concurrent subscribers wait for it
    /// and return its result.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn subscribe(&self, node: &str, event: &str) -> Result<(), EventError> {
        let node = self.node_name(node);
        let key = proxy_key(&node, event);
        loop {
            match self.next_step(&key) {
                None => return Ok(()),
                Some(Step::Register(done)) => return self.register(&node, event, key, done).await,
                Some(Step::Follow(mut rx)) => match rx.wait_for(Option::is_some).await {
                    Ok(registered) => return registered.clone().unwrap_or(Ok(())),
                    // The registering task was dropped before finishing, take over.
                    Err(_) => continue,
                },
            }
        }
    }

    fn next_step(&self, key: &str) -> Option<Step> {
        let mut proxies = self.proxies.lock();
        let Some(proxy) = proxies.get_mut(key) else {
            let (proxy, tx) = Proxy::pending();
            proxies.insert(key.to_string(), proxy);
            return Some(Step::Register(tx));
        };
        match &proxy.registration {
            Registration::Done => return None,
            Registration::Pending(rx) if rx.has_changed().is_ok() => {
                return Some(Step::Follow(rx.clone()));
            }
            Registration::Pending(_) => {}
        }
        let (tx, rx) = watch::channel(None);
        proxy.registration = Registration::Pending(rx);
        Some(Step::Register(tx))
    }

    async fn register(
        &self,
        node: &str,
        event: &str,
        key: String,
        done: watch::Sender<Registered>,
    ) -> Result<(), EventError> {
        let subscriber = Value::from(self.directory.self_node().name.as_str());
        let result = self
            .invoker
            .callnr(node, EVENT_SUBSCRIBE, vec![Value::from(event), subscriber])
            .await
            .map_err(EventError::from);

        {
            let mut proxies = self.proxies.lock();
            match &result {
                Ok(()) => {
                    if let Some(proxy) = proxies.get_mut(&key) {
                        proxy.registration = Registration::Done;
                    }
                    tracing::debug!(key=%key, "Subscribed");
                }
                Err(e) => {
                    proxies.remove(&key);
                    tracing::debug!(key=%key, error=%e, "Subscription failed");
                }
            }
        }
        done.send_replace(Some(result.clone()));
        result
    }

    /// Subscribe if needed, then wait for the next value of `event` on `node`.
    ///
    /// A value that was fired while nobody was waiting is returned immediately.
    /// Only one waiter per key is allowed at a time.
    pub async fn waitfor(&self, node: &str, event: &str) -> Result<Value, EventError> {
        self.subscribe(node, event).await?;
        let key = proxy_key(&self.node_name(node), event);

        let rx = {
            let mut proxies = self.proxies.lock();
            let proxy = proxies.entry(key.clone()).or_insert(Proxy {
                slot: Slot::Empty,
                registration: Registration::Done,
            });
            let slot = &mut proxy.slot;
            match std::mem::replace(slot, Slot::Empty) {
                Slot::Ready(value) => return Ok(value),
                Slot::Waiting(tx) if !tx.is_closed() => {
                    *slot = Slot::Waiting(tx);
                    return Err(EventError::AlreadyWaiting(key));
                }
                Slot::Waiting(_) | Slot::Empty => {
                    let (tx, rx) = oneshot::channel();
                    *slot = Slot::Waiting(tx);
                    rx
                }
            }
        };

        rx.await.map_err(|_| EventError::Shutdown)
    }

    /// Deliver `value` to every subscriber of the local event `event`.
    ///
    /// Returns how many subscribers the value was sent to. Subscribers whose
    /// address cannot be resolved are skipped.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub async fn fire(&self, event: &str, value: Value) -> Result<usize, EventError> {
        let subscribers: Vec<String> = match self.registrations.read().get(event) {
            Some(subscribers) => subscribers.iter().cloned().collect(),
            None => return Err(EventError::NoSuchEvent(event.to_string())),
        };

        let key = proxy_key(&self.directory.self_node().name, event);
        let mut notified = 0;
        for subscriber in subscribers {
            match self
                .invoker
                .callnr(&subscriber, &key, vec![value.clone()])
                .await
            {
                Ok(()) => notified += 1,
                Err(CallError::Resolve(e)) => {
                    tracing::warn!(subscriber=%subscriber, error=%e, "Skipping unreachable subscriber");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(notified)
    }

    /// Create the local registration for `event` so it can be fired before
    /// anyone subscribes.
    pub fn declare(&self, event: &str) {
        self.registrations
            .write()
            .entry(event.to_string())
            .or_default();
    }

    /// Record `subscriber` against the local event `event`, creating the
    /// registration if needed. Returns false if it was already recorded.
    pub fn add_subscriber(&self, event: &str, subscriber: &str) -> bool {
        let added = self
            .registrations
            .write()
            .entry(event.to_string())
            .or_default()
            .insert(subscriber.to_string());
        if added {
            tracing::debug!(event=%event, subscriber=%subscriber, "New subscriber");
        }
        added
    }

    pub fn subscribers(&self, event: &str) -> Vec<String> {
        self.registrations
            .read()
            .get(event)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fill the proxy slot for `key`. Returns false when no proxy exists,
    /// i.e. `key` is not a subscribed event.
    pub fn deliver(&self, key: &str, value: Value) -> bool {
        let mut proxies = self.proxies.lock();
        let Some(Proxy { slot, .. }) = proxies.get_mut(key) else {
            return false;
        };
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Waiting(tx) => {
                if let Err(value) = tx.send(value) {
                    *slot = Slot::Ready(value);
                }
            }
            Slot::Empty | Slot::Ready(_) => *slot = Slot::Ready(value),
        }
        true
    }

    /// Wake every parked waiter with a shutdown error.
    pub(crate) fn close(&self) {
        for proxy in self.proxies.lock().values_mut() {
            if matches!(proxy.slot, Slot::Waiting(_)) {
                proxy.slot = Slot::Empty;
            }
        }
    }

    fn node_name(&self, node: &str) -> String {
        if node == SELF {
            self.directory.self_node().name.clone()
        } else {
            node.to_string()
        }
    }
}
