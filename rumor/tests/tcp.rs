use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use assert_matches::assert_matches;
use rumor::prelude::*;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

fn loopback(name: &str) -> Config {
    Config::new(name)
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_multicast(None)
        .with_resolve(1, Duration::from_millis(50))
        .with_ack_timeout(Duration::from_secs(1))
        .with_call_timeout(Some(Duration::from_secs(5)))
}

async fn pair() -> (Runtime, Runtime) {
    let a = Runtime::bind(loopback("A")).await.expect("bind A");
    let b = Runtime::bind(loopback("B")).await.expect("bind B");
    b.register_fn("echo", |inv: Invocation| async move {
        Ok(inv.args.into_iter().next().unwrap_or_default())
    });
    a.learn("B", b.address());
    (a, b)
}

#[test_log::test(tokio::test)]
async fn test_echo_then_connfail_after_shutdown() {
    let (a, b) = pair().await;

    let reply = a.call("B", "echo", vec!["hi".into()]).await.unwrap();
    assert_eq!(reply, Value::from("hi"));
    // B learned where A lives from the call itself.
    assert_eq!(b.directory().cached_address("A"), Some(Some(a.address())));

    b.shutdown().await;
    let err = a.call("B", "echo", vec!["hi".into()]).await.unwrap_err();
    assert_eq!(err.code(), Some(&ErrorCode::CONNFAIL));

    a.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_large_arguments_survive_the_wire() {
    let (a, b) = pair().await;

    let blob: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let reply = a
        .call("B", "echo", vec![Value::from(blob.clone())])
        .await
        .unwrap();
    assert_eq!(reply, Value::Bytes(blob));

    a.shutdown().await;
    b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_event_over_tcp() {
    let (a, b) = pair().await;

    a.subscribe("B", "tick").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while b.subscribers("tick").is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "subscription never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(b.fire("tick", 1).await, Ok(1));
    let value = tokio::time::timeout(Duration::from_secs(2), a.waitfor("B", "tick"))
        .await
        .expect("event delivered");
    assert_eq!(value, Ok(Value::from(1)));

    a.shutdown().await;
    b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_unknown_node_without_multicast() {
    let a = Runtime::bind(loopback("A")).await.unwrap();

    let err = a.call("nobody", "echo", vec![]).await.unwrap_err();
    assert_matches!(
        err,
        CallError::Resolve(ResolveError::UnknownNode { attempts: 2, .. })
    );

    a.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_bind_conflict_is_reported() {
    let a = Runtime::bind(loopback("A")).await.unwrap();
    let taken = loopback("B").with_bind_addr(a.address());

    assert_matches!(
        Runtime::bind(taken).await.err(),
        Some(RuntimeError::Bind { .. })
    );

    a.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_nodes_find_each_other_over_multicast() {
    let multicast = MulticastConfig {
        group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 78), 47177),
        interface: Ipv4Addr::LOCALHOST,
        ttl: 1,
    };
    let config = |name: &str| {
        loopback(name)
            .with_multicast(Some(multicast.clone()))
            .with_resolve(4, Duration::from_millis(250))
    };
    let a = Runtime::bind(config("mc-A")).await.unwrap();
    let b = Runtime::bind(config("mc-B")).await.unwrap();
    b.register_fn("echo", |inv: Invocation| async move {
        Ok(inv.args.into_iter().next().unwrap_or_default())
    });

    assert_eq!(a.resolve("mc-B").await, Ok(b.address()));
    // Answering the query taught B where A lives.
    assert_eq!(b.directory().cached_address("mc-A"), Some(Some(a.address())));
    assert_eq!(
        a.call("mc-B", "echo", vec![Value::from(7)]).await,
        Ok(Value::from(7))
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_peer_that_never_acknowledges_fails_with_noack() {
    let mute = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mute_addr = mute.local_addr().unwrap();
    // Accept and hold connections without ever answering.
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = mute.accept().await {
            held.push(stream);
        }
    });

    let a = Runtime::bind(loopback("A")).await.unwrap();
    a.learn("mute", mute_addr);

    let err = tokio::time::timeout(Duration::from_secs(3), a.call("mute", "echo", vec![]))
        .await
        .expect("bounded by the ack timeout")
        .unwrap_err();
    assert_eq!(err.code(), Some(&ErrorCode::NOACK));
    // NOACK is not a connection failure, the binding stays.
    assert_eq!(a.directory().cached_address("mute"), Some(Some(mute_addr)));

    a.shutdown().await;
    holder.abort();
}

#[test_log::test(tokio::test)]
async fn test_idle_connection_is_closed_by_the_listener() {
    let b = Runtime::bind(loopback("B")).await.unwrap();

    let mut idle = TcpStream::connect(b.address()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), idle.read(&mut buf))
        .await
        .expect("listener gives up on a silent connection");
    assert_matches!(read, Ok(0));

    b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_closes_open_connections() {
    let b = Runtime::bind(loopback("B").with_ack_timeout(Duration::from_secs(30)))
        .await
        .unwrap();

    let mut idle = TcpStream::connect(b.address()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.shutdown().await;

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(1), idle.read(&mut buf))
        .await
        .expect("connection task stopped with the node");
    assert_matches!(read, Ok(0) | Err(_));
}
