use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;

use super::*;
use crate::envelope::Kind;
use crate::node::Node;
use crate::test_utils::prelude::*;

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 9000))
}

#[test_log::test(tokio::test)]
async fn test_self_sentinel_needs_no_query() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    assert_eq!(a.resolve(SELF).await, Ok(a.address()));
    assert_eq!(a.resolve("A").await, Ok(a.address()));
    assert_eq!(test.network.multicasts(), 0);
}

#[test_log::test(tokio::test)]
async fn test_cached_name_needs_no_query() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);

    assert_eq!(a.resolve("B").await, Ok(b.address()));
    assert_eq!(test.network.multicasts(), 0);
}

#[test_log::test(tokio::test)]
async fn test_unanswered_name_fails_after_every_attempt() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    let err = a.resolve("ghost").await.unwrap_err();
    assert_eq!(
        err,
        ResolveError::UnknownNode {
            node: "ghost".to_string(),
            attempts: 3,
        }
    );

    wait_for_condition(|| test.network.multicasts() == 3, Duration::from_secs(1))
        .await
        .expect("three queries");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(test.network.multicasts(), 3);
}

#[test_log::test(tokio::test)]
async fn test_queried_node_answers_with_its_address() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");

    assert_eq!(a.directory().cached_address("B"), None);
    assert_eq!(a.resolve("B").await, Ok(b.address()));
    assert_eq!(a.directory().cached_address("B"), Some(Some(b.address())));

    // The querier's own address is learned by the responder on the way.
    assert_eq!(b.directory().cached_address("A"), Some(Some(a.address())));
}

#[test_log::test(tokio::test)]
async fn test_known_name_with_empty_address() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    a.learn("C", SocketAddr::from(([0, 0, 0, 0], 9000)));

    assert_matches!(
        a.resolve("C").await,
        Err(ResolveError::AddressNotKnown(name)) if name == "C"
    );
}

#[test_log::test(tokio::test)]
async fn test_wakes_as_soon_as_the_cache_fills() {
    let directory = Arc::new(NodeDirectory::new(Node::new("A", addr(1))));
    let (outbound, mut queries) = mpsc::channel(8);
    let resolver = NodeResolver::new(directory.clone(), outbound, 1, Duration::from_secs(30));

    let responder = tokio::spawn(async move {
        let query = queries.recv().await.expect("a query");
        assert_eq!(query.kind(), Kind::Broadcast);
        assert_eq!(query.resource(), NODE_QUERY);
        assert_eq!(query.args()[0], Value::from("B"));
        assert_eq!(query.args()[1], Value::from(addr(1).to_string()));
        directory.record_address("B", addr(2));
    });

    let resolved = tokio::time::timeout(Duration::from_secs(5), resolver.resolve("B"))
        .await
        .expect("resolution does not wait out the interval");
    assert_eq!(resolved, Ok(addr(2)));
    responder.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_closed_outbound_queue_is_shutdown() {
    let directory = Arc::new(NodeDirectory::new(Node::new("A", addr(1))));
    let (outbound, queries) = mpsc::channel(1);
    drop(queries);
    let resolver = NodeResolver::new(directory, outbound, 3, Duration::from_millis(10));

    assert_eq!(resolver.resolve("B").await, Err(ResolveError::Shutdown));
}
