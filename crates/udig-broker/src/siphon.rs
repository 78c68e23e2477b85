use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use udig_common::{BrokerChannel, TunnelError};
use udig_protocol::{Down, Up, UpHeader, DEFAULT_DATA_FRAME_SIZE, NEW_STREAM_PATH};

/// Byte counts of a finished siphon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiphonStats {
    /// Bytes read from the public connection and sent to the link
    pub up: u64,
    /// Bytes received from the link and written to the public connection
    pub down: u64,
}

/// Relay a public connection over a new tunnel stream on `channel`.
///
/// Public input becomes `Up` frames (the first one names the tunnel) and
/// `Down` frames are written back. Either side finishing only half-closes
/// the other; the relay returns once both directions are done, or as soon
/// as one of them fails.
pub async fn siphon<S>(
    conn: S,
    tunnel_id: &str,
    channel: &BrokerChannel,
) -> Result<SiphonStats, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = channel.open(NEW_STREAM_PATH).await?;
    let (mut sender, mut receiver) = stream.split();
    let (mut reader, mut writer) = tokio::io::split(conn);

    let up = async {
        let mut buf = vec![0u8; DEFAULT_DATA_FRAME_SIZE];
        let mut header = Some(UpHeader {
            tunnel_id: tunnel_id.to_string(),
        });
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                sender
                    .send(Up {
                        header: header.take(),
                        data: Vec::new(),
                        finish: true,
                    })
                    .await?;
                sender.finish()?;
                tracing::trace!("Public side of {} finished after {} bytes", tunnel_id, total);
                return Ok::<_, TunnelError>(total);
            }

            sender
                .send(Up {
                    header: header.take(),
                    data: buf[..n].to_vec(),
                    finish: false,
                })
                .await?;
            total += n as u64;
        }
    };

    let down = async {
        let mut total = 0u64;

        while let Some(frame) = receiver.recv::<Down>().await? {
            if !frame.data.is_empty() {
                writer.write_all(&frame.data).await?;
                total += frame.data.len() as u64;
            }
            if frame.finish {
                break;
            }
        }

        writer.shutdown().await?;
        tracing::trace!("Link side of {} finished after {} bytes", tunnel_id, total);
        Ok::<_, TunnelError>(total)
    };

    let result = tokio::try_join!(up, down);
    match result {
        Ok((up, down)) => Ok(SiphonStats { up, down }),
        Err(e) => {
            sender.reset();
            Err(e)
        }
    }
}
