use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::test_utils::prelude::*;

async fn wait_for_subscriber(owner: &Runtime, event: &str, subscriber: &str) {
    wait_for_condition(
        || owner.subscribers(event).iter().any(|s| s == subscriber),
        Duration::from_secs(1),
    )
    .await
    .expect("subscription registered");
}

#[test]
fn test_proxy_key() {
    assert_eq!(proxy_key("B", "tick"), "B:tick");
}

#[test_log::test(tokio::test)]
async fn test_fired_value_reaches_remote_waiter_once() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");

    a.subscribe("B", "tick").await.unwrap();
    a.subscribe("B", "tick").await.unwrap();
    wait_for_subscriber(&b, "tick", "A").await;
    assert_eq!(b.subscribers("tick"), vec!["A".to_string()]);

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.waitfor("B", "tick").await })
    };
    assert_eq!(b.fire("tick", 1).await, Ok(1));

    let value = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter wakes")
        .unwrap();
    assert_eq!(value, Ok(Value::from(1)));

    // The slot was consumed, a new wait needs a new value.
    let again = tokio::time::timeout(Duration::from_millis(100), a.waitfor("B", "tick")).await;
    assert!(again.is_err());
}

#[test_log::test(tokio::test)]
async fn test_fire_unknown_event() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    assert_eq!(
        a.fire("nothing", Value::Null).await,
        Err(EventError::NoSuchEvent("nothing".to_string()))
    );

    a.declare("nothing");
    assert_eq!(a.fire("nothing", Value::Null).await, Ok(0));
}

#[test_log::test(tokio::test)]
async fn test_second_waiter_is_rejected() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    a.subscribe("B", "tick").await.unwrap();
    wait_for_subscriber(&b, "tick", "A").await;

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.waitfor("B", "tick").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        a.waitfor("B", "tick").await,
        Err(EventError::AlreadyWaiting("B:tick".to_string()))
    );

    b.fire("tick", "go").await.unwrap();
    assert_eq!(first.await.unwrap(), Ok(Value::from("go")));
}

#[test_log::test(tokio::test)]
async fn test_value_fired_before_waiting_is_kept() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    a.subscribe("B", "tick").await.unwrap();
    wait_for_subscriber(&b, "tick", "A").await;

    let before = test.network.deliveries();
    b.fire("tick", 1).await.unwrap();
    wait_for_condition(|| test.network.deliveries() == before + 1, Duration::from_secs(1))
        .await
        .unwrap();
    b.fire("tick", 2).await.unwrap();
    wait_for_condition(|| test.network.deliveries() == before + 2, Duration::from_secs(1))
        .await
        .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(1), a.waitfor("B", "tick"))
        .await
        .expect("held value");
    assert_eq!(value, Ok(Value::from(2)));
}

#[test_log::test(tokio::test)]
async fn test_local_events_never_touch_the_network() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    a.subscribe(SELF, "e").await.unwrap();
    wait_for_subscriber(&a, "e", "A").await;

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.waitfor(SELF, "e").await })
    };
    assert_eq!(a.fire("e", "x").await, Ok(1));
    assert_eq!(waiter.await.unwrap(), Ok(Value::from("x")));
    assert_eq!(test.network.deliveries(), 0);
}

#[test_log::test(tokio::test)]
async fn test_subscribe_to_unknown_node_can_be_retried() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    for _ in 0..2 {
        let err = a.subscribe("ghost", "tick").await.unwrap_err();
        assert_matches!(
            err,
            EventError::Call(CallError::Resolve(ResolveError::UnknownNode { .. }))
        );
    }

    let err = a.waitfor("ghost", "tick").await.unwrap_err();
    assert_matches!(err, EventError::Call(CallError::Resolve(_)));
}

#[test_log::test(tokio::test)]
async fn test_fire_skips_unresolvable_subscribers() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    let c = test.join("C");
    test.introduce(&[&a, &b, &c]);

    a.subscribe("B", "tick").await.unwrap();
    c.subscribe("B", "tick").await.unwrap();
    wait_for_subscriber(&b, "tick", "A").await;
    wait_for_subscriber(&b, "tick", "C").await;

    test.network.kill(c.address());
    b.directory().forget("C");

    assert_eq!(b.fire("tick", 5).await, Ok(1));
    let value = tokio::time::timeout(Duration::from_secs(1), a.waitfor("B", "tick"))
        .await
        .expect("A still gets the value");
    assert_eq!(value, Ok(Value::from(5)));
}

#[test_log::test(tokio::test)]
async fn test_waiter_wakes_on_shutdown() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    a.subscribe(SELF, "e").await.unwrap();

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.waitfor(SELF, "e").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.shutdown().await;

    assert_eq!(waiter.await.unwrap(), Err(EventError::Shutdown));
}

#[test_log::test(tokio::test)]
async fn test_concurrent_subscribers_share_the_registration_outcome() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.subscribe("ghost", "tick").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = a.subscribe("ghost", "tick").await;
    assert_matches!(
        second,
        Err(EventError::Call(CallError::Resolve(ResolveError::UnknownNode { .. })))
    );
    assert_matches!(
        first.await.unwrap(),
        Err(EventError::Call(CallError::Resolve(ResolveError::UnknownNode { .. })))
    );
    // Only the first subscriber queried the network.
    assert_eq!(test.network.multicasts(), 3);

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.waitfor("ghost", "tick").await })
    };
    assert_matches!(waiter.await.unwrap(), Err(EventError::Call(CallError::Resolve(_))));
    assert!(!a.is_shutdown());
}

#[test_log::test(tokio::test)]
async fn test_waiter_joining_a_failing_registration_gets_the_error() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.subscribe("ghost", "tick").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waited = a.waitfor("ghost", "tick").await;
    assert_matches!(
        waited,
        Err(EventError::Call(CallError::Resolve(ResolveError::UnknownNode { .. })))
    );
    assert!(first.await.unwrap().is_err());
    assert!(!a.is_shutdown());
}
