//! udig broker library
//!
//! Accepts uplink connections from links, registers them under the tunnel
//! name derived from their key, and forwards public TLS connections to them
//! based on the SNI the client asked for. Embeddable for testing.

mod config;
mod debug;
mod ingress;
mod registration;
mod router;
mod siphon;
mod uplink;

pub use config::{parse_ports, BrokerConfig, ResolvedBrokerConfig};
pub use debug::DebugPlane;
pub use ingress::{parse_tunnel_id, IngressPlane, HANDSHAKE_TIMEOUT};
pub use registration::{
    effective_ports, ingress_addresses, RegistrationError, RegistrationState, Registrar,
    RouteGuard, NONCE_LENGTH,
};
pub use router::{RegisteredUplink, RouteTable, SessionId};
pub use siphon::{siphon, SiphonStats};
pub use uplink::UplinkPlane;
