use thiserror::Error;
use udig_protocol::CodecError;

/// Errors raised while moving data over an uplink connection
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Stream error: {0}")]
    Stream(#[from] h2::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid request: {0}")]
    Request(#[from] http::Error),
}

impl TunnelError {
    /// True when the error means the stream or its connection went away,
    /// as opposed to a local failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TunnelError::ConnectionClosed => true,
            TunnelError::Stream(e) => e.is_io() || e.is_go_away() || e.is_reset(),
            TunnelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
