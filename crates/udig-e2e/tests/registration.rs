//! Registration end-to-end tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use udig_common::KeyPair;
use udig_e2e::{MockTcpService, TestBroker, TestLink};
use udig_link::{
    keep_dialing, CallError, EgressServer, Services, StatusUpdate, UplinkServer, UplinkService,
};
use udig_protocol::{RegisterRequest, RegisterTrigger, SetupRequest, SetupResponse};

/// Initialize tracing and crypto provider for tests
fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("udig_broker=debug,udig_link=debug,udig_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Signs with the wrong key while presenting its own public key
struct ForgingUplink {
    keys: KeyPair,
    forger: KeyPair,
    setups: mpsc::UnboundedSender<SetupRequest>,
}

#[async_trait]
impl UplinkService for ForgingUplink {
    async fn register(&self, trigger: RegisterTrigger) -> Result<RegisterRequest, CallError> {
        Ok(RegisterRequest {
            ed25519_public_key: self.keys.public_key().to_vec(),
            signature: self.forger.sign(&trigger.nonce),
            ports: Vec::new(),
        })
    }

    async fn setup(&self, request: SetupRequest) -> Result<SetupResponse, CallError> {
        let _ = self.setups.send(request);
        Ok(SetupResponse::default())
    }
}

#[tokio::test]
async fn test_link_receives_ingress_address() {
    init_test();

    let broker = TestBroker::start().await;
    let mock = MockTcpService::start().await;

    let mut link = TestLink::start(broker.uplink_addr, &mock.addr_string());
    let addresses = link.wait_for_ingress().await;

    assert_eq!(addresses, vec![format!("{}.udig.io:443", link.tunnel_id)]);
    assert_eq!(link.tunnel_id.as_str().len(), 61);
    assert!(link.tunnel_id.as_str().starts_with("bahwqcera"));

    assert!(broker.wait_for_sessions(link.tunnel_id.as_str(), 1).await);
    assert_eq!(broker.router.len(), 1);
}

#[tokio::test]
async fn test_route_is_withdrawn_when_link_disconnects() {
    init_test();

    let broker = TestBroker::start().await;
    let mock = MockTcpService::start().await;

    let mut link = TestLink::start(broker.uplink_addr, &mock.addr_string());
    link.wait_for_ingress().await;
    let tunnel_id = link.tunnel_id.to_string();
    assert!(broker.wait_for_sessions(&tunnel_id, 1).await);

    drop(link);

    assert!(
        broker.wait_for_sessions(&tunnel_id, 0).await,
        "route should disappear once the link is gone"
    );
    assert!(broker.router.is_empty());
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    init_test();

    let broker = TestBroker::start().await;

    let (setups_tx, mut setups) = mpsc::unbounded_channel();
    let keys = KeyPair::generate();
    let uplink = ForgingUplink {
        keys: keys.clone(),
        forger: KeyPair::generate(),
        setups: setups_tx,
    };
    let services = Services::new(Arc::new(uplink), Arc::new(EgressServer::new("127.0.0.1:1")));
    let task = tokio::spawn(keep_dialing(
        broker.uplink_addr.to_string(),
        services,
        Duration::from_millis(50),
    ));

    let request = tokio::time::timeout(Duration::from_secs(5), setups.recv())
        .await
        .expect("Timed out waiting for setup")
        .expect("Setup channel closed");

    match request {
        SetupRequest::Error(error) => assert_eq!(error.code, "unauthenticated"),
        SetupRequest::Ingress(addresses) => panic!("Forged link got addresses {:?}", addresses),
    }
    assert_eq!(broker.router.sessions_for(keys.tunnel_id().as_str()), 0);
    assert!(broker.router.is_empty());

    task.abort();
}

#[tokio::test]
async fn test_link_without_enabled_ports_still_registers() {
    init_test();

    let broker = TestBroker::start().await;

    // The test broker only enables 443
    let keys = KeyPair::generate();
    let tunnel_id = keys.tunnel_id();
    let (uplink, mut updates) = UplinkServer::new(keys, vec![8443]);
    let services = Services::new(Arc::new(uplink), Arc::new(EgressServer::new("127.0.0.1:1")));
    let task = tokio::spawn(keep_dialing(
        broker.uplink_addr.to_string(),
        services,
        Duration::from_millis(50),
    ));

    let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("Timed out waiting for status")
        .expect("Status channel closed");

    assert_eq!(update, StatusUpdate::Ingress(Vec::new()));
    assert!(broker.wait_for_sessions(tunnel_id.as_str(), 1).await);
    assert_eq!(broker.router.sessions_for(tunnel_id.as_str()), 1);

    task.abort();
}

#[tokio::test]
async fn test_link_keeps_redialing() {
    init_test();

    // Accepts and immediately hangs up, like a broker that keeps dying
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let (uplink, _updates) = UplinkServer::new(KeyPair::generate(), Vec::new());
    let services = Services::new(Arc::new(uplink), Arc::new(EgressServer::new("127.0.0.1:1")));
    let task = tokio::spawn(keep_dialing(
        addr.to_string(),
        services,
        Duration::from_millis(50),
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    task.abort();

    let attempts = accepts.load(Ordering::SeqCst);
    assert!(attempts >= 3, "expected at least 3 dial attempts, got {}", attempts);
}

#[tokio::test]
async fn test_links_sharing_a_key_share_a_route() {
    init_test();

    let broker = TestBroker::start().await;
    let mock = MockTcpService::start().await;
    let keys = KeyPair::generate();

    let mut first = TestLink::start_with_keys(broker.uplink_addr, &mock.addr_string(), keys.clone());
    let mut second = TestLink::start_with_keys(broker.uplink_addr, &mock.addr_string(), keys);

    assert_eq!(first.wait_for_ingress().await, second.wait_for_ingress().await);

    let tunnel_id = first.tunnel_id.to_string();
    assert!(broker.wait_for_sessions(&tunnel_id, 2).await);
    assert_eq!(broker.router.len(), 1);

    drop(first);
    assert!(broker.wait_for_sessions(&tunnel_id, 1).await);
}
