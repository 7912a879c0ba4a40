use std::net::SocketAddr;
use std::time::Duration;

use super::*;
use crate::envelope::CallId;
use crate::node::Node;
use crate::resolver::NodeResolver;

struct Running {
    outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<Envelope>,
    cancellation: CancellationToken,
}

fn local() -> Node {
    Node::new("A", SocketAddr::from(([10, 0, 0, 1], 9000)))
}

fn caller() -> Node {
    Node::new("B", SocketAddr::from(([10, 0, 0, 2], 9000)))
}

/// A router whose outbound queue holds `capacity` envelopes and is only
/// drained by the test.
fn start(capacity: usize) -> Running {
    let directory = Arc::new(NodeDirectory::new(local()));
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let cancellation = CancellationToken::new();
    let pending = PendingCalls::new();

    let resolver = NodeResolver::new(
        directory.clone(),
        outbound_tx.clone(),
        1,
        Duration::from_millis(10),
    );
    let invoker = CallInvoker::new(
        directory.clone(),
        resolver,
        pending.clone(),
        outbound_tx.clone(),
        inbound_tx.clone(),
        cancellation.clone(),
        None,
        true,
    );
    let events = EventBus::new(directory.clone(), invoker.clone());
    let router = Router::new(
        directory,
        pending,
        ResourceRegistry::new(),
        events,
        invoker,
        outbound_tx,
        inbound_rx,
        cancellation.clone(),
    );
    tokio::spawn(router.run());

    Running {
        outbound: outbound_rx,
        inbound: inbound_tx,
        cancellation,
    }
}

async fn call_missing(running: &Running, id: u64) {
    let call = Envelope::call(&caller(), local().address, "missing", vec![], CallId(id));
    running.inbound.send(call).await.unwrap();
}

async fn drain(running: &mut Running) -> Vec<Envelope> {
    let mut replies = Vec::new();
    while let Ok(Some(reply)) =
        tokio::time::timeout(Duration::from_millis(100), running.outbound.recv()).await
    {
        replies.push(reply);
    }
    replies
}

#[test_log::test(tokio::test)]
async fn test_replies_answer_unknown_resources() {
    let mut running = start(8);
    call_missing(&running, 1).await;

    let replies = drain(&mut running).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].clone().into_return(),
        Some((CallId(1), Outcome::Failure(ErrorCode::NORESOURCE)))
    );
    running.cancellation.cancel();
}

#[test_log::test(tokio::test)]
async fn test_deferred_replies_are_bounded_by_queue_capacity() {
    let mut running = start(2);
    for id in 0..10 {
        call_missing(&running, id).await;
    }
    // Let the router work through the inbound queue while nothing drains.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two replies fit the queue and two more were deferred, the rest dropped.
    let replies = drain(&mut running).await;
    assert_eq!(replies.len(), 4);

    // The router keeps answering once the queue has room again.
    call_missing(&running, 99).await;
    let replies = drain(&mut running).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].call_id(), Some(CallId(99)));
    running.cancellation.cancel();
}
