//! Public traffic end-to-end tests

use std::collections::HashSet;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use udig_common::KeyPair;
use udig_e2e::{MockTcpService, TcpServiceMode, TestBroker, TestLink};

/// Initialize tracing and crypto provider for tests
fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("udig_broker=debug,udig_link=debug,udig_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Start a broker and one registered link forwarding to `mock`
async fn tunnel_to(mock: &MockTcpService) -> (TestBroker, TestLink) {
    let broker = TestBroker::start().await;
    let mut link = TestLink::start(broker.uplink_addr, &mock.addr_string());
    link.wait_for_ingress().await;
    assert!(broker.wait_for_sessions(link.tunnel_id.as_str(), 1).await);
    (broker, link)
}

#[tokio::test]
async fn test_tunnel_echo() {
    init_test();

    let mock = MockTcpService::start().await;
    let (broker, link) = tunnel_to(&mock).await;

    let mut stream = broker
        .connect_ingress(&broker.host_for(link.tunnel_id.as_str()))
        .await
        .expect("Failed to connect to ingress");

    stream
        .write_all(b"Hello through udig!")
        .await
        .expect("Failed to write");
    stream.flush().await.expect("Failed to flush");

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("Read timeout")
        .expect("Read error");
    assert_eq!(&buf[..n], b"Hello through udig!");

    drop(stream);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connections = mock.get_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].received_data, b"Hello through udig!");
}

#[tokio::test]
async fn test_unknown_tunnel_is_closed() {
    init_test();

    let mock = MockTcpService::start().await;
    let (broker, _link) = tunnel_to(&mock).await;

    let mut stream = broker
        .connect_ingress("abc123.udig.io")
        .await
        .expect("TLS handshake should still complete");
    let _ = stream.write_all(b"anyone there?").await;

    let mut buf = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("Connection should be closed");

    // A clean close or a reset, but never data
    match result {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => tracing::debug!("Unknown tunnel connection ended with {}", e),
    }
    assert!(buf.is_empty());
    assert_eq!(mock.connection_count(), 0);
}

#[tokio::test]
async fn test_half_close_reaches_local_service() {
    init_test();

    let mock = MockTcpService::start_with_mode(TcpServiceMode::ReplyOnEof).await;
    let (broker, link) = tunnel_to(&mock).await;

    let mut stream = broker
        .connect_ingress(&broker.host_for(link.tunnel_id.as_str()))
        .await
        .expect("Failed to connect to ingress");

    stream.write_all(b"hello").await.expect("Failed to write");
    // Only the write side; the reply still has to come back
    stream.shutdown().await.expect("Failed to half-close");

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .expect("Read timeout")
        .expect("Read error");

    assert_eq!(reply, b"hello");
}

#[tokio::test]
async fn test_large_transfer() {
    init_test();

    let mock = MockTcpService::start().await;
    let (broker, link) = tunnel_to(&mock).await;

    let stream = broker
        .connect_ingress(&broker.host_for(link.tunnel_id.as_str()))
        .await
        .expect("Failed to connect to ingress");
    let (mut reader, mut writer) = tokio::io::split(stream);

    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let to_send = payload.clone();
    let sender = tokio::spawn(async move {
        writer.write_all(&to_send).await.expect("Failed to write");
        writer.flush().await.expect("Failed to flush");
        writer
    });

    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(20), reader.read_exact(&mut received))
        .await
        .expect("Read timeout")
        .expect("Read error");

    let _writer = sender.await.unwrap();
    assert!(received == payload, "echoed payload differs");
}

#[tokio::test]
async fn test_round_robin_across_links() {
    init_test();

    let broker = TestBroker::start().await;
    let one = MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"one".to_vec())).await;
    let two = MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"two".to_vec())).await;

    let keys = KeyPair::generate();
    let mut first = TestLink::start_with_keys(broker.uplink_addr, &one.addr_string(), keys.clone());
    let mut second = TestLink::start_with_keys(broker.uplink_addr, &two.addr_string(), keys);
    first.wait_for_ingress().await;
    second.wait_for_ingress().await;

    let host = broker.host_for(first.tunnel_id.as_str());
    assert!(broker.wait_for_sessions(first.tunnel_id.as_str(), 2).await);

    let mut replies = HashSet::new();
    for _ in 0..4 {
        let mut stream = broker
            .connect_ingress(&host)
            .await
            .expect("Failed to connect to ingress");
        stream.write_all(b"who?").await.expect("Failed to write");

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
            .await
            .expect("Read timeout")
            .expect("Read error");
        replies.insert(reply);
    }

    assert!(replies.contains(&b"one".to_vec()));
    assert!(replies.contains(&b"two".to_vec()));
}

#[tokio::test]
async fn test_open_connection_ends_when_link_is_lost() {
    init_test();

    let mock = MockTcpService::start_with_mode(TcpServiceMode::Accumulate).await;
    let (broker, link) = tunnel_to(&mock).await;
    let tunnel_id = link.tunnel_id.to_string();

    let mut stream = broker
        .connect_ingress(&broker.host_for(&tunnel_id))
        .await
        .expect("Failed to connect to ingress");
    stream.write_all(b"still there?").await.expect("Failed to write");
    stream.flush().await.expect("Failed to flush");

    // Give the relay time to reach the local service
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(link);

    let mut buf = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    assert!(result.is_ok(), "public connection should not outlive its link");
    assert!(buf.is_empty());
    assert!(broker.wait_for_sessions(&tunnel_id, 0).await);
}
