use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;

use crate::test_utils::prelude::*;

fn remote_code(result: Result<Value, CallError>) -> ErrorCode {
    match result {
        Err(CallError::Remote { code, .. }) => code,
        other => panic!("expected a failed RETURN, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_echo_then_connfail_after_kill() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join_with_echo("B");
    assert_eq!(a.address(), "10.0.0.1:9000".parse().unwrap());
    assert_eq!(b.address(), "10.0.0.2:9000".parse().unwrap());

    let reply = a.call("B", "echo", vec!["hi".into()]).await.unwrap();
    assert_eq!(reply, Value::from("hi"));

    test.network.kill(b.address());
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        a.call("B", "echo", vec!["hi".into()]),
    )
    .await
    .expect("a refused connection never hangs");
    assert_eq!(remote_code(result), ErrorCode::CONNFAIL);

    // The stale binding is gone so the next call re-resolves.
    assert_eq!(a.directory().cached_address("B"), None);
    assert_eq!(a.in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_connfail_keeps_binding_when_eviction_is_disabled() {
    let test = NodeTestHarness::new();
    let a = test.join_with(test_config("A").with_evict_on_connfail(false));
    let b = test.join_with_echo("B");
    test.introduce(&[&a, &b]);

    test.network.kill(b.address());
    let result = a.call("B", "echo", vec![]).await;
    assert_eq!(remote_code(result), ErrorCode::CONNFAIL);
    assert_eq!(a.directory().cached_address("B"), Some(Some(b.address())));
}

#[test_log::test(tokio::test)]
async fn test_concurrent_calls_get_their_own_results() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    b.register_fn("delay", |inv: Invocation| async move {
        let ms = inv.arg(0).and_then(Value::as_int).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok(Value::from(ms))
    });

    let calls = (0..20i64).rev().map(|i| {
        let a = a.clone();
        tokio::spawn(async move { (i * 5, a.call("B", "delay", vec![Value::from(i * 5)]).await) })
    });

    for call in futures::future::join_all(calls).await {
        let (sent, result) = call.unwrap();
        assert_eq!(result, Ok(Value::from(sent)));
    }
    assert_eq!(a.in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_self_sentinel_and_self_name_are_equivalent() {
    let test = NodeTestHarness::new();
    let a = test.join_with_echo("A");

    let by_sentinel = a.call(SELF, "echo", vec![Value::from(42)]).await;
    let by_name = a.call("A", "echo", vec![Value::from(42)]).await;

    assert_eq!(by_sentinel, Ok(Value::from(42)));
    assert_eq!(by_sentinel, by_name);
    assert_eq!(test.network.deliveries(), 0);
    assert_eq!(test.network.multicasts(), 0);
}

#[test_log::test(tokio::test)]
async fn test_callnr_does_not_wait_for_a_silent_peer() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    test.network.silence(b.address());

    tokio::time::timeout(
        Duration::from_millis(100),
        a.callnr("B", "echo", vec!["hi".into()]),
    )
    .await
    .expect("callnr returns once queued")
    .unwrap();
    assert_eq!(a.in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_callnr_reaches_the_resource() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    b.register_fn("count", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    a.callnr("B", "count", vec![]).await.unwrap();
    wait_for_condition(|| seen.load(Ordering::SeqCst) == 1, Duration::from_secs(1))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_silent_peer_fails_with_noack() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join_with_echo("B");
    test.introduce(&[&a, &b]);
    test.network.silence(b.address());

    let result = a.call("B", "echo", vec![]).await;
    assert_eq!(remote_code(result), ErrorCode::NOACK);
    assert_eq!(a.directory().cached_address("B"), Some(Some(b.address())));

    test.network.revive(b.address());
    assert_eq!(a.call("B", "echo", vec![]).await, Ok(Value::Null));
}

#[test_log::test(tokio::test)]
async fn test_deadline_expiry_fails_with_timeout() {
    let test = NodeTestHarness::new();
    let a = test.join_with(test_config("A").with_call_timeout(Some(Duration::from_millis(200))));
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    b.register_fn("hang", |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    });

    let result = a.call("B", "hang", vec![]).await;
    assert_eq!(remote_code(result), ErrorCode::TIMEOUT);
    assert_eq!(a.in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_application_error_code_is_carried_verbatim() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);
    b.register_fn("fail", |_| async { Err(ErrorCode::new("EBOOM")) });

    let err = a.call("B", "fail", vec![]).await.unwrap_err();
    assert_matches!(&err, CallError::Remote { resource, .. } if resource == "fail");
    assert_eq!(err.code(), Some(&ErrorCode::new("EBOOM")));
}

#[test_log::test(tokio::test)]
async fn test_unknown_resource_fails_with_noresource() {
    let test = NodeTestHarness::new();
    let a = test.join("A");
    let b = test.join("B");
    test.introduce(&[&a, &b]);

    let result = a.call("B", "missing", vec![]).await;
    assert_eq!(remote_code(result), ErrorCode::NORESOURCE);
}

#[test_log::test(tokio::test)]
async fn test_unresolvable_node_fails_before_anything_is_sent() {
    let test = NodeTestHarness::new();
    let a = test.join("A");

    let err = a.call("ghost", "echo", vec![]).await.unwrap_err();
    assert_matches!(
        err,
        CallError::Resolve(ResolveError::UnknownNode { attempts: 3, .. })
    );
    assert_eq!(test.network.deliveries(), 0);
    assert_eq!(a.in_flight(), 0);

    let err = a.callnr("ghost", "echo", vec![]).await.unwrap_err();
    assert_matches!(err, CallError::Resolve(_));
}

#[test_log::test(tokio::test)]
async fn test_broadcast_reaches_every_node() {
    let test = NodeTestHarness::new();
    let nodes: Vec<Runtime> = ["A", "B", "C"].iter().map(|name| test.join(name)).collect();

    let heard = Arc::new(AtomicUsize::new(0));
    for node in &nodes {
        let heard = heard.clone();
        node.register_fn("hello", move |inv: Invocation| {
            let heard = heard.clone();
            async move {
                assert_eq!(inv.source, "A");
                heard.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    }

    nodes[0].broadcast("hello", vec![]).await.unwrap();
    wait_for_condition(|| heard.load(Ordering::SeqCst) == 3, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(test.network.multicasts(), 1);
}

#[test_log::test(tokio::test)]
async fn test_calls_fail_after_shutdown() {
    let test = NodeTestHarness::new();
    let a = test.join_with_echo("A");
    a.shutdown().await;

    assert!(a.is_shutdown());
    assert_eq!(a.call(SELF, "echo", vec![]).await, Err(CallError::Shutdown));
    assert_eq!(a.broadcast("echo", vec![]).await, Err(CallError::Shutdown));
}
