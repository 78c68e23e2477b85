//! udig link library
//!
//! Dials a udig broker, proves the link identity, and serves the tunnel
//! streams the broker opens by connecting each one to a local TCP service.

mod config;
mod connector;
mod egress;
mod keystore;
mod server;
mod uplink;

pub use config::{parse_port_maps, PortMapError, PortMaps};
pub use connector::{dial, keep_dialing, DEFAULT_BACKOFF, DIAL_TIMEOUT};
pub use egress::EgressServer;
pub use keystore::{default_keypair_path, ensure_keypair, load_keypair, save_keypair, KeystoreError};
pub use server::{serve, CallError, Services, TunnelService, UplinkService};
pub use uplink::{StatusUpdate, UplinkServer};
