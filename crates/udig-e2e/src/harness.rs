//! In-process broker for E2E tests
//!
//! Binds the uplink and one ingress listener on ephemeral ports. The ingress
//! listener stands in for port 443, which is the only enabled port, so the
//! addresses announced to links read `{tunnel_id}.udig.io:443` while public
//! clients actually connect to [`TestBroker::ingress_addr`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use udig_broker::{IngressPlane, Registrar, RouteTable, UplinkPlane};

use crate::certificates::TestCertificates;

/// Domain served by every test broker
pub const TEST_DOMAIN: &str = "udig.io";

/// A running test broker
pub struct TestBroker {
    /// Where links dial
    pub uplink_addr: SocketAddr,
    /// Where public clients connect
    pub ingress_addr: SocketAddr,
    /// Live route table, for assertions
    pub router: Arc<RouteTable>,
    /// Certificates the ingress presents
    pub certs: Arc<TestCertificates>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestBroker {
    /// Start a broker with generated certificates and port 443 enabled
    pub async fn start() -> Self {
        let certs = Arc::new(TestCertificates::generate(TEST_DOMAIN));

        let tls_config =
            udig_common::load_server_config_from_pem(&certs.server_cert_pem, &certs.server_key_pem)
                .expect("Failed to load ingress TLS config");
        let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let router = RouteTable::new();
        let registrar = Registrar::new(router.clone(), TEST_DOMAIN.to_string(), vec![443]);

        let ingress = IngressPlane::new(router.clone(), tls_acceptor);
        let uplink = UplinkPlane::new(registrar);

        let uplink_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind uplink listener");
        let ingress_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind ingress listener");

        let uplink_addr = uplink_listener.local_addr().unwrap();
        let ingress_addr = ingress_listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = uplink.run_with_listener(uplink_listener) => {
                    tracing::error!("Uplink plane stopped: {:?}", result);
                }
                result = ingress.run_with_listener(ingress_listener) => {
                    tracing::error!("Ingress plane stopped: {:?}", result);
                }
                _ = shutdown_rx => {
                    tracing::debug!("Test broker shutting down");
                }
            }
        });

        Self {
            uplink_addr,
            ingress_addr,
            router,
            certs,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Hostname a public client uses to reach `tunnel_id`
    pub fn host_for(&self, tunnel_id: &str) -> String {
        format!("{}.{}", tunnel_id, TEST_DOMAIN)
    }

    /// Open a TLS connection to the ingress listener with the given SNI
    pub async fn connect_ingress(&self, server_name: &str) -> anyhow::Result<TlsStream<TcpStream>> {
        let client_config = udig_common::load_client_config_from_pem(&self.certs.ca_cert_pem)?;
        let connector = TlsConnector::from(Arc::new(client_config));

        let stream = TcpStream::connect(self.ingress_addr).await?;
        let _ = stream.set_nodelay(true);
        let server_name = ServerName::try_from(server_name.to_string())?;

        Ok(connector.connect(server_name, stream).await?)
    }

    /// Wait until `tunnel_id` has `sessions` live sessions
    pub async fn wait_for_sessions(&self, tunnel_id: &str, sessions: usize) -> bool {
        for _ in 0..100 {
            if self.router.sessions_for(tunnel_id) == sessions {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
