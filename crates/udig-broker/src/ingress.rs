use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::router::RouteTable;
use crate::siphon::siphon;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Longest a public client may take to finish its TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extract the tunnel id from an SNI server name.
///
/// The id is the first label of `{tunnel_id}.{domain}`, lowercased. Names
/// without a dot or with an empty first label yield `None`.
pub fn parse_tunnel_id(server_name: &str) -> Option<String> {
    let (label, _domain) = server_name.split_once('.')?;
    if label.is_empty() {
        return None;
    }
    Some(label.to_ascii_lowercase())
}

/// Public TLS listener that forwards connections to links by SNI
pub struct IngressPlane {
    router: Arc<RouteTable>,
    tls_acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl IngressPlane {
    pub fn new(router: Arc<RouteTable>, tls_acceptor: TlsAcceptor) -> Arc<Self> {
        Self::with_handshake_timeout(router, tls_acceptor, HANDSHAKE_TIMEOUT)
    }

    /// Established connections are never timed out, only the handshake.
    pub fn with_handshake_timeout(
        router: Arc<RouteTable>,
        tls_acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            tls_acceptor,
            handshake_timeout,
        })
    }

    /// Start listening for public connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Accept public connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Ingress listening on {}", local_addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Ingress connection from {} on {}", peer_addr, local_addr);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Ingress accept error on {}: {}", local_addr, e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let handshake = self.tls_acceptor.accept(stream);
        let mut tls_stream = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::debug!("TLS handshake with {} failed: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake with {} timed out", peer_addr);
                return;
            }
        };

        let server_name = tls_stream.get_ref().1.server_name().map(str::to_string);
        let tunnel_id = match server_name.as_deref().and_then(parse_tunnel_id) {
            Some(id) => id,
            None => {
                tracing::debug!("Malformed SNI {:?} from {}", server_name, peer_addr);
                return;
            }
        };

        let uplink = match self.router.pick_for(&tunnel_id) {
            Some(uplink) => uplink,
            None => {
                tracing::warn!("No route for tunnel {} (from {})", tunnel_id, peer_addr);
                let _ = tls_stream.shutdown().await;
                return;
            }
        };

        tracing::debug!(
            "Siphoning {} to tunnel {} (session {})",
            peer_addr,
            tunnel_id,
            uplink.session_id
        );

        match siphon(tls_stream, &tunnel_id, &uplink.channel).await {
            Ok(stats) => tracing::debug!(
                "Siphon {} -> {} done ({} bytes up, {} bytes down)",
                peer_addr,
                tunnel_id,
                stats.up,
                stats.down
            ),
            Err(e) if e.is_disconnect() => {
                tracing::debug!("Siphon {} -> {} interrupted: {}", peer_addr, tunnel_id, e)
            }
            Err(e) => tracing::warn!("Siphon {} -> {} failed: {}", peer_addr, tunnel_id, e),
        }
    }
}
