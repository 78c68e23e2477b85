//! Registration of a freshly accepted uplink connection.
//!
//! ```text
//! Connected -> NonceSent -> Verifying -> Registered -> Closed
//!                                    \-> Rejected   -> Closed
//! ```
//!
//! The broker proves the link owns the key its tunnel name is derived from
//! by having it sign a random nonce. A registered session stays in the route
//! table until its uplink connection is lost.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use udig_common::{verify, BrokerChannel, IdentityError, TunnelError, TunnelId};
use udig_protocol::{
    RegisterRequest, RegisterTrigger, SetupError, SetupRequest, SetupResponse, REGISTER_PATH,
    SETUP_PATH,
};
use uuid::Uuid;

use crate::router::{RegisteredUplink, RouteTable, SessionId};

/// Size of the challenge the link has to sign
pub const NONCE_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Connected,
    NonceSent,
    Verifying,
    Registered,
    Rejected,
    Closed,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Register call failed: {0}")]
    Register(#[source] TunnelError),

    #[error("Link ended the register call without replying")]
    NoReply,

    #[error("Bad signature")]
    BadSignature,

    #[error("Invalid public key: {0}")]
    Identity(#[from] IdentityError),

    #[error("Setup call failed: {0}")]
    Setup(#[source] TunnelError),
}

impl RegistrationError {
    /// Status code reported to the link in a Setup error
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::BadSignature => "unauthenticated",
            RegistrationError::Identity(_) => "invalid_argument",
            RegistrationError::Register(_)
            | RegistrationError::NoReply
            | RegistrationError::Setup(_) => "unavailable",
        }
    }

    /// Whether the link should be told about this failure. Failures of the
    /// RPCs themselves leave nothing usable to report through.
    fn is_reportable(&self) -> bool {
        !matches!(
            self,
            RegistrationError::Register(_)
                | RegistrationError::NoReply
                | RegistrationError::Setup(_)
        )
    }
}

/// Ports a link gets: the requested ones that are enabled, in enabled order,
/// or every enabled port when nothing specific was requested.
pub fn effective_ports(requested: &[u16], enabled: &[u16]) -> Vec<u16> {
    enabled
        .iter()
        .copied()
        .filter(|port| requested.is_empty() || requested.contains(port))
        .collect()
}

/// Public addresses for a tunnel, `{tunnel_id}.{domain}:{port}`
pub fn ingress_addresses(tunnel_id: &TunnelId, domain: &str, ports: &[u16]) -> Vec<String> {
    ports
        .iter()
        .map(|port| format!("{}.{}:{}", tunnel_id, domain, port))
        .collect()
}

/// Keeps a session published; withdraws it when dropped.
pub struct RouteGuard {
    router: Arc<RouteTable>,
    tunnel_id: TunnelId,
    session_id: SessionId,
}

impl RouteGuard {
    pub fn publish(router: Arc<RouteTable>, uplink: RegisteredUplink) -> Self {
        let guard = Self {
            router: router.clone(),
            tunnel_id: uplink.tunnel_id.clone(),
            session_id: uplink.session_id,
        };
        router.add(uplink);
        tracing::info!(
            "Route added: {} (session {}, {} active)",
            guard.tunnel_id,
            guard.session_id,
            router.sessions_for(guard.tunnel_id.as_str())
        );
        guard
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if self
            .router
            .remove(self.tunnel_id.as_str(), self.session_id)
        {
            tracing::info!(
                "Route removed: {} (session {})",
                self.tunnel_id,
                self.session_id
            );
        }
    }
}

/// Drives registrations for every accepted uplink connection
pub struct Registrar {
    router: Arc<RouteTable>,
    domain: String,
    enabled_ports: Vec<u16>,
}

/// Progress of a single uplink connection
struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: RegistrationState,
}

impl Session {
    fn advance(&mut self, next: RegistrationState) {
        tracing::debug!(
            "Session {} from {}: {} -> {}",
            self.id,
            self.peer,
            self.state,
            next
        );
        self.state = next;
    }
}

impl Registrar {
    pub fn new(router: Arc<RouteTable>, domain: String, enabled_ports: Vec<u16>) -> Arc<Self> {
        Arc::new(Self {
            router,
            domain,
            enabled_ports,
        })
    }

    /// Register the link behind `channel` and keep its route published until
    /// the connection is lost. Returns the state the session ended in before
    /// closing.
    pub async fn run(&self, channel: BrokerChannel, peer: SocketAddr) -> RegistrationState {
        let mut session = Session {
            id: Uuid::new_v4(),
            peer,
            state: RegistrationState::Connected,
        };

        let outcome = match self.register(&channel, &mut session).await {
            Ok(tunnel_id) => {
                session.advance(RegistrationState::Registered);
                let _guard = RouteGuard::publish(
                    self.router.clone(),
                    RegisteredUplink {
                        tunnel_id,
                        session_id: session.id,
                        channel: channel.clone(),
                    },
                );
                channel.closed().await;
                RegistrationState::Registered
            }
            Err(e) => {
                session.advance(RegistrationState::Rejected);
                tracing::warn!("Rejected uplink {} (session {}): {}", peer, session.id, e);
                if e.is_reportable() {
                    let error = SetupError::new(e.code(), e.to_string());
                    if let Err(e) = self.setup(&channel, SetupRequest::Error(error)).await {
                        tracing::debug!("Failed to report rejection to {}: {}", peer, e);
                    }
                }
                channel.close();
                RegistrationState::Rejected
            }
        };

        session.advance(RegistrationState::Closed);
        outcome
    }

    async fn register(
        &self,
        channel: &BrokerChannel,
        session: &mut Session,
    ) -> Result<TunnelId, RegistrationError> {
        let mut nonce = vec![0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        session.advance(RegistrationState::NonceSent);
        let request = self.call_register(channel, nonce.clone()).await?;

        session.advance(RegistrationState::Verifying);
        if !verify(&request.ed25519_public_key, &nonce, &request.signature) {
            return Err(RegistrationError::BadSignature);
        }
        let tunnel_id = TunnelId::from_public_key(&request.ed25519_public_key)?;

        // An empty set still registers
        let ports = effective_ports(&request.ports, &self.enabled_ports);
        if ports.is_empty() {
            tracing::warn!(
                "Uplink {} requested ports {:?}, none of which are enabled",
                session.peer,
                request.ports
            );
        }

        let addresses = ingress_addresses(&tunnel_id, &self.domain, &ports);
        tracing::info!("Setting up uplink {} for tunnel {}", session.peer, tunnel_id);
        self.setup(channel, SetupRequest::Ingress(addresses))
            .await
            .map_err(RegistrationError::Setup)?;

        Ok(tunnel_id)
    }

    async fn call_register(
        &self,
        channel: &BrokerChannel,
        nonce: Vec<u8>,
    ) -> Result<RegisterRequest, RegistrationError> {
        let mut stream = channel
            .open(REGISTER_PATH)
            .await
            .map_err(RegistrationError::Register)?;
        stream
            .send(RegisterTrigger { nonce })
            .await
            .map_err(RegistrationError::Register)?;
        stream.finish().map_err(RegistrationError::Register)?;

        stream
            .recv::<RegisterRequest>()
            .await
            .map_err(RegistrationError::Register)?
            .ok_or(RegistrationError::NoReply)
    }

    async fn setup(&self, channel: &BrokerChannel, request: SetupRequest) -> Result<(), TunnelError> {
        let mut stream = channel.open(SETUP_PATH).await?;
        stream.send(request).await?;
        stream.finish()?;

        match stream.recv::<SetupResponse>().await? {
            Some(_) => Ok(()),
            None => Err(TunnelError::Protocol(
                "link ended the setup call without replying".to_string(),
            )),
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Connected => "connected",
            RegistrationState::NonceSent => "nonce-sent",
            RegistrationState::Verifying => "verifying",
            RegistrationState::Registered => "registered",
            RegistrationState::Rejected => "rejected",
            RegistrationState::Closed => "closed",
        };
        f.write_str(name)
    }
}
