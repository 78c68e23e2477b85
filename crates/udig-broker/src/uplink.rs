use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use udig_common::BrokerChannel;

use crate::registration::Registrar;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Listener for links dialing in
pub struct UplinkPlane {
    registrar: Arc<Registrar>,
}

impl UplinkPlane {
    pub fn new(registrar: Arc<Registrar>) -> Arc<Self> {
        Arc::new(Self { registrar })
    }

    /// Start listening for uplink connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Accept uplink connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Uplink listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::info!("Uplink connection from {}", peer_addr);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Uplink accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let channel = match BrokerChannel::handshake(stream).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("Uplink handshake with {} failed: {}", peer_addr, e);
                return;
            }
        };

        let state = self.registrar.run(channel, peer_addr).await;
        tracing::info!("Uplink {} disconnected ({})", peer_addr, state);
    }
}
