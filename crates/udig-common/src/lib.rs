//! Building blocks shared by `udigd` and `udiglink`.

pub mod channel;
mod error;
pub mod identity;
mod tls;

pub use channel::{BrokerChannel, IncomingStream, LinkChannel, StreamReceiver, StreamSender, TunnelStream};
pub use error::TunnelError;
pub use identity::{verify, IdentityError, KeyPair, TunnelId};
pub use tls::{
    load_certs_from_pem, load_client_config_from_pem, load_private_key_from_pem,
    load_server_config, load_server_config_from_pem,
};
