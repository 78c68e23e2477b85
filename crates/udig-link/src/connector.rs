use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use udig_common::LinkChannel;

use crate::server::{serve, Services};

/// Give up on a dial attempt after this long
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between connection attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Dial the broker and serve its calls until the connection drops.
///
/// Only returns on failure; a lost connection is reported as an error too.
pub async fn dial(addr: &str, services: &Services) -> Result<()> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("Timed out dialing {}", addr))?
        .with_context(|| format!("Failed to dial {}", addr))?;
    let _ = stream.set_nodelay(true);

    let channel = LinkChannel::handshake(stream)
        .await
        .with_context(|| format!("Uplink handshake with {} failed", addr))?;
    tracing::info!("Connected to broker {}", addr);

    serve(channel, services.clone()).await;
    anyhow::bail!("Connection to {} lost", addr)
}

/// Keep a connection to the broker up, forever.
///
/// Every failure is logged and retried after `backoff`.
pub async fn keep_dialing(addr: String, services: Services, backoff: Duration) {
    loop {
        if let Err(e) = dial(&addr, &services).await {
            tracing::error!("{:#}", e);
        }
        tracing::info!("Reconnecting in {:?}...", backoff);
        tokio::time::sleep(backoff).await;
    }
}
