use async_trait::async_trait;
use tokio::sync::mpsc;
use udig_common::KeyPair;
use udig_protocol::{RegisterRequest, RegisterTrigger, SetupError, SetupRequest, SetupResponse};

use crate::server::{CallError, UplinkService};

/// Registration outcome reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Public addresses the tunnel is reachable at
    Ingress(Vec<String>),
    /// The broker refused the registration
    Rejected(SetupError),
}

/// Answers the broker's registration calls with the link identity
pub struct UplinkServer {
    keys: KeyPair,
    ports: Vec<u16>,
    status: mpsc::UnboundedSender<StatusUpdate>,
}

impl UplinkServer {
    /// `ports` are the requested ingress ports; empty asks for all of them.
    pub fn new(keys: KeyPair, ports: Vec<u16>) -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (status, updates) = mpsc::unbounded_channel();
        (
            Self {
                keys,
                ports,
                status,
            },
            updates,
        )
    }
}

#[async_trait]
impl UplinkService for UplinkServer {
    async fn register(&self, trigger: RegisterTrigger) -> Result<RegisterRequest, CallError> {
        tracing::debug!("Signing {} byte nonce", trigger.nonce.len());
        Ok(RegisterRequest {
            ed25519_public_key: self.keys.public_key().to_vec(),
            signature: self.keys.sign(&trigger.nonce),
            ports: self.ports.clone(),
        })
    }

    async fn setup(&self, request: SetupRequest) -> Result<SetupResponse, CallError> {
        let update = match request {
            SetupRequest::Ingress(addresses) => {
                tracing::info!("Tunnel ingress addresses: {:?}", addresses);
                StatusUpdate::Ingress(addresses)
            }
            SetupRequest::Error(error) => {
                tracing::error!("Registration error: {}", error);
                StatusUpdate::Rejected(error)
            }
        };
        // Nobody listening is fine
        let _ = self.status.send(update);
        Ok(SetupResponse::default())
    }
}
