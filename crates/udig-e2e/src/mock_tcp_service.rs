//! Mock local TCP service, the target links forward to in E2E tests

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Behavior of the mock TCP service
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Send a fixed response after the first read, then close
    FixedResponse(Vec<u8>),
    /// Read until the peer closes, answer nothing
    Accumulate,
    /// Read until the peer half-closes, then send everything back and close
    ReplyOnEof,
}

/// A recorded TCP connection
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockTcpService {
    /// Start an echo service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();

        let connections: Arc<RwLock<Vec<RecordedTcpConnection>>> =
            Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let recorded = connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock TCP service shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let recorded = recorded.clone();
                                let mode = mode.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, peer_addr, recorded, mode).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Mock TCP accept error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Connections that have finished so far
    pub fn get_connections(&self) -> Vec<RecordedTcpConnection> {
        self.connections.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn total_bytes_received(&self) -> usize {
        self.connections
            .read()
            .iter()
            .map(|c| c.received_data.len())
            .sum()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    mode: TcpServiceMode,
) {
    let mut received_data = Vec::new();
    let mut buf = [0u8; 16 * 1024];

    match mode {
        TcpServiceMode::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    received_data.extend_from_slice(&buf[..n]);
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        tracing::error!("Echo write error: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Echo read error: {}", e);
                    break;
                }
            }
        },
        TcpServiceMode::FixedResponse(response) => {
            if let Ok(n) = stream.read(&mut buf).await {
                received_data.extend_from_slice(&buf[..n]);
            }
            if let Err(e) = stream.write_all(&response).await {
                tracing::error!("Fixed response write error: {}", e);
            }
        }
        TcpServiceMode::Accumulate => {
            if let Err(e) = stream.read_to_end(&mut received_data).await {
                tracing::error!("Accumulate read error: {}", e);
            }
        }
        TcpServiceMode::ReplyOnEof => match stream.read_to_end(&mut received_data).await {
            Ok(_) => {
                if let Err(e) = stream.write_all(&received_data).await {
                    tracing::error!("Reply write error: {}", e);
                }
            }
            Err(e) => tracing::error!("Reply read error: {}", e),
        },
    }

    let _ = stream.shutdown().await;

    connections.write().push(RecordedTcpConnection {
        received_data,
        peer_addr,
    });
}
