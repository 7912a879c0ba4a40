use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::*;
use crate::envelope::{CallId, Outcome};
use crate::errors::TransportError;
use crate::node::Node;
use crate::value::Value;

#[derive(Clone, Copy)]
enum Behavior {
    Ack,
    Refuse,
    Silent,
}

struct ScriptedTransport {
    behavior: Behavior,
    delivered: Mutex<Vec<(SocketAddr, Envelope)>>,
    multicasts: Mutex<usize>,
}

impl ScriptedTransport {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            behavior,
            delivered: Mutex::new(Vec::new()),
            multicasts: Mutex::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        match self.behavior {
            Behavior::Ack => {
                let envelope = Frame::<Envelope>::decode_datagram(&frame)?
                    .payload
                    .ok()
                    .expect("an envelope frame");
                self.delivered.lock().push((to, envelope));
                Ok(())
            }
            Behavior::Refuse => Err(TransportError::Connect("connection refused".into())),
            Behavior::Silent => Err(TransportError::NoAck("timed out".into())),
        }
    }

    async fn multicast(&self, _frame: Bytes) -> Result<(), TransportError> {
        *self.multicasts.lock() += 1;
        Err(TransportError::Multicast("network unreachable".into()))
    }
}

struct Running {
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<Envelope>,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

fn caller() -> Node {
    Node::new("A", SocketAddr::from(([10, 0, 0, 1], 9000)))
}

fn remote() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 9000))
}

fn start(transport: Arc<ScriptedTransport>) -> Running {
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let cancellation = CancellationToken::new();
    let dispatcher = OutboundDispatcher::new(
        transport,
        caller().address,
        outbound_rx,
        inbound_tx,
        cancellation.clone(),
    );
    Running {
        outbound: outbound_tx,
        inbound: inbound_rx,
        cancellation,
        task: tokio::spawn(dispatcher.run()),
    }
}

async fn next_inbound(running: &mut Running) -> Option<Envelope> {
    tokio::time::timeout(Duration::from_millis(200), running.inbound.recv())
        .await
        .ok()
        .flatten()
}

#[test_log::test(tokio::test)]
async fn test_delivers_remote_calls_through_the_transport() {
    let transport = ScriptedTransport::new(Behavior::Ack);
    let mut running = start(transport.clone());

    let call = Envelope::call(&caller(), remote(), "echo", vec!["hi".into()], CallId(1));
    running.outbound.send(call.clone()).await.unwrap();

    assert!(next_inbound(&mut running).await.is_none());
    assert_eq!(transport.delivered.lock().as_slice(), &[(remote(), call)]);
}

#[test_log::test(tokio::test)]
async fn test_local_destination_skips_the_transport() {
    let transport = ScriptedTransport::new(Behavior::Refuse);
    let mut running = start(transport.clone());

    let own_call = Envelope::call(&caller(), caller().address, "echo", vec![], CallId(5));
    let own_reply = own_call.reply(&caller(), Outcome::Ok(Value::from(2))).unwrap();
    running.outbound.send(own_reply.clone()).await.unwrap();

    assert_eq!(next_inbound(&mut running).await, Some(own_reply));
    assert!(transport.delivered.lock().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_failed_return_is_absorbed() {
    let mut running = start(ScriptedTransport::new(Behavior::Refuse));

    let b = Node::new("B", remote());
    let call = Envelope::call(&b, caller().address, "echo", vec![], CallId(4));
    let reply = call.reply(&caller(), Outcome::Ok(Value::from(1))).unwrap();
    running.outbound.send(reply).await.unwrap();

    assert_eq!(next_inbound(&mut running).await, None);
}

#[test_log::test(tokio::test)]
async fn test_refused_connection_wakes_the_caller_with_connfail() {
    let mut running = start(ScriptedTransport::new(Behavior::Refuse));

    let call = Envelope::call(&caller(), remote(), "echo", vec![], CallId(9));
    running.outbound.send(call).await.unwrap();

    let failure = next_inbound(&mut running).await.expect("synthetic RETURN");
    assert_eq!(failure.kind(), Kind::Return);
    assert_eq!(failure.source_node(), "A");
    assert_eq!(
        failure.into_return(),
        Some((CallId(9), Outcome::Failure(ErrorCode::CONNFAIL)))
    );
}

#[test_log::test(tokio::test)]
async fn test_missing_acknowledgement_wakes_the_caller_with_noack() {
    let mut running = start(ScriptedTransport::new(Behavior::Silent));

    let call = Envelope::call(&caller(), remote(), "echo", vec![], CallId(3));
    running.outbound.send(call).await.unwrap();

    let failure = next_inbound(&mut running).await.expect("synthetic RETURN");
    assert_eq!(
        failure.into_return(),
        Some((CallId(3), Outcome::Failure(ErrorCode::NOACK)))
    );
}

#[test_log::test(tokio::test)]
async fn test_fire_and_forget_failures_are_absorbed() {
    let transport = ScriptedTransport::new(Behavior::Refuse);
    let mut running = start(transport.clone());

    let callnr = Envelope::call_nr(&caller(), remote(), "log", vec![]);
    running.outbound.send(callnr).await.unwrap();
    let broadcast = Envelope::broadcast(&caller(), "announce", vec![]);
    running.outbound.send(broadcast).await.unwrap();

    assert_eq!(next_inbound(&mut running).await, None);
    assert_eq!(*transport.multicasts.lock(), 1);
}

#[test_log::test(tokio::test)]
async fn test_stops_on_cancellation() {
    let running = start(ScriptedTransport::new(Behavior::Ack));
    running.cancellation.cancel();
    tokio::time::timeout(Duration::from_secs(1), running.task)
        .await
        .expect("dispatcher stops")
        .unwrap();
}
