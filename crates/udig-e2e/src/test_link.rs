//! Link running in-process against a test broker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use udig_common::{KeyPair, TunnelId};
use udig_link::{keep_dialing, EgressServer, Services, StatusUpdate, UplinkServer};

/// Reconnect quickly so tests do not wait on the production backoff
pub const TEST_BACKOFF: Duration = Duration::from_millis(50);

/// A link dialing a broker in the background. Stops when dropped.
pub struct TestLink {
    pub tunnel_id: TunnelId,
    updates: mpsc::UnboundedReceiver<StatusUpdate>,
    task: JoinHandle<()>,
}

impl TestLink {
    /// Start a link with a fresh identity that forwards to `local_addr`
    pub fn start(uplink_addr: SocketAddr, local_addr: &str) -> Self {
        Self::start_with_keys(uplink_addr, local_addr, KeyPair::generate())
    }

    pub fn start_with_keys(uplink_addr: SocketAddr, local_addr: &str, keys: KeyPair) -> Self {
        let tunnel_id = keys.tunnel_id();
        let (uplink, updates) = UplinkServer::new(keys, Vec::new());
        let services = Services::new(Arc::new(uplink), Arc::new(EgressServer::new(local_addr)));

        let task = tokio::spawn(keep_dialing(uplink_addr.to_string(), services, TEST_BACKOFF));

        Self {
            tunnel_id,
            updates,
            task,
        }
    }

    /// Next registration outcome reported by the broker
    pub async fn next_status(&mut self, timeout: Duration) -> Option<StatusUpdate> {
        tokio::time::timeout(timeout, self.updates.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the broker to accept the link and return its addresses
    pub async fn wait_for_ingress(&mut self) -> Vec<String> {
        match self.next_status(Duration::from_secs(5)).await {
            Some(StatusUpdate::Ingress(addresses)) => addresses,
            other => panic!("Expected ingress addresses, got {:?}", other),
        }
    }
}

impl Drop for TestLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
