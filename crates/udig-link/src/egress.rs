use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use udig_common::{StreamReceiver, StreamSender, TunnelError, TunnelStream};
use udig_protocol::{Down, Up, DEFAULT_DATA_FRAME_SIZE};

use crate::server::TunnelService;

/// Connects every tunnel stream to one local TCP service
pub struct EgressServer {
    local_addr: String,
}

impl EgressServer {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
        }
    }
}

#[async_trait]
impl TunnelService for EgressServer {
    async fn new_stream(&self, mut stream: TunnelStream) {
        let local = match TcpStream::connect(&self.local_addr).await {
            Ok(local) => local,
            Err(e) => {
                tracing::error!(
                    "Failed to connect to local service {}: {}",
                    self.local_addr,
                    e
                );
                stream.refuse();
                return;
            }
        };
        let _ = local.set_nodelay(true);

        let (sender, receiver) = stream.split();
        match relay(local, sender, receiver).await {
            Ok((up, down)) => tracing::debug!(
                "Stream to {} done ({} bytes in, {} bytes out)",
                self.local_addr,
                up,
                down
            ),
            Err(e) if e.is_disconnect() => {
                tracing::debug!("Stream to {} interrupted: {}", self.local_addr, e)
            }
            Err(e) => tracing::warn!("Stream to {} failed: {}", self.local_addr, e),
        }
    }
}

/// Pump `Up` frames into `local` and its output back as `Down` frames.
///
/// Returns the byte counts written to and read from `local`.
async fn relay<S>(
    local: S,
    mut sender: StreamSender,
    mut receiver: StreamReceiver,
) -> Result<(u64, u64), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(local);

    let inbound = async {
        let mut total = 0u64;
        while let Some(frame) = receiver.recv::<Up>().await? {
            if let Some(header) = &frame.header {
                tracing::debug!("New stream for tunnel {}", header.tunnel_id);
            }
            if !frame.data.is_empty() {
                writer.write_all(&frame.data).await?;
                total += frame.data.len() as u64;
            }
            if frame.finish {
                break;
            }
        }
        writer.shutdown().await?;
        Ok::<_, TunnelError>(total)
    };

    let outbound = async {
        let mut buf = vec![0u8; DEFAULT_DATA_FRAME_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                sender
                    .send(Down {
                        data: Vec::new(),
                        finish: true,
                    })
                    .await?;
                sender.finish()?;
                return Ok::<_, TunnelError>(total);
            }
            sender
                .send(Down {
                    data: buf[..n].to_vec(),
                    finish: false,
                })
                .await?;
            total += n as u64;
        }
    };

    let result = tokio::try_join!(inbound, outbound);
    if result.is_err() {
        sender.reset();
    }
    result
}
