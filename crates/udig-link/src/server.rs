//! Dispatch of broker calls to link services.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use udig_common::{IncomingStream, LinkChannel, TunnelError, TunnelStream};
use udig_protocol::{
    RegisterRequest, RegisterTrigger, SetupRequest, SetupResponse, NEW_STREAM_PATH, REGISTER_PATH,
    SETUP_PATH,
};

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Call ended before its request arrived")]
    MissingRequest,

    #[error("{0}")]
    Service(String),
}

/// Registration calls made by the broker
#[async_trait]
pub trait UplinkService: Send + Sync + 'static {
    async fn register(&self, trigger: RegisterTrigger) -> Result<RegisterRequest, CallError>;

    async fn setup(&self, request: SetupRequest) -> Result<SetupResponse, CallError>;
}

/// Tunnel streams opened by the broker, one per public connection
#[async_trait]
pub trait TunnelService: Send + Sync + 'static {
    async fn new_stream(&self, stream: TunnelStream);
}

/// Services offered to the broker over one uplink connection
#[derive(Clone)]
pub struct Services {
    pub uplink: Arc<dyn UplinkService>,
    pub tunnel: Arc<dyn TunnelService>,
}

impl Services {
    pub fn new(uplink: Arc<dyn UplinkService>, tunnel: Arc<dyn TunnelService>) -> Self {
        Self { uplink, tunnel }
    }
}

/// Serve broker calls until the connection is gone. Every call runs in its
/// own task.
pub async fn serve(mut channel: LinkChannel, services: Services) {
    while let Some(IncomingStream { path, stream }) = channel.accept().await {
        tracing::debug!("Incoming call {}", path);
        let services = services.clone();
        tokio::spawn(async move {
            dispatch(&path, stream, &services).await;
        });
    }
}

async fn dispatch(path: &str, mut stream: TunnelStream, services: &Services) {
    let result = match path {
        REGISTER_PATH => {
            async {
                let trigger: RegisterTrigger = read_request(&mut stream).await?;
                let reply = services.uplink.register(trigger).await?;
                write_response(&mut stream, reply).await
            }
            .await
        }
        SETUP_PATH => {
            async {
                let request: SetupRequest = read_request(&mut stream).await?;
                let reply = services.uplink.setup(request).await?;
                write_response(&mut stream, reply).await
            }
            .await
        }
        NEW_STREAM_PATH => {
            services.tunnel.new_stream(stream).await;
            return;
        }
        _ => {
            tracing::warn!("Unknown call {}", path);
            stream.reset();
            return;
        }
    };

    if let Err(e) = result {
        tracing::warn!("Call {} failed: {}", path, e);
        stream.reset();
    }
}

async fn read_request<T: DeserializeOwned>(stream: &mut TunnelStream) -> Result<T, CallError> {
    stream.recv().await?.ok_or(CallError::MissingRequest)
}

async fn write_response<T: Serialize>(stream: &mut TunnelStream, reply: T) -> Result<(), CallError> {
    stream.send(reply).await?;
    stream.finish()?;
    Ok(())
}
