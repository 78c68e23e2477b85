//! Wire protocol shared by the udig broker and link.
//!
//! Every logical stream on an uplink connection carries one RPC, identified
//! by its HTTP/2 request path. Stream bodies are sequences of
//! length-delimited JSON frames (see [`TunnelCodec`]).

mod codec;
mod messages;

pub use codec::{CodecError, TunnelCodec, MAX_FRAME_SIZE};
pub use messages::{
    Down, RegisterRequest, RegisterTrigger, SetupError, SetupRequest, SetupResponse, Up, UpHeader,
};

/// Broker asks the link to prove its identity.
pub const REGISTER_PATH: &str = "/udig.uplink.Uplink/Register";

/// Broker tells the link how registration ended.
pub const SETUP_PATH: &str = "/udig.uplink.Uplink/Setup";

/// Broker opens one of these per public connection it forwards.
pub const NEW_STREAM_PATH: &str = "/udig.tunnel.Tunnel/NewStream";

/// Read buffer size used when siphoning a raw connection into frames.
pub const DEFAULT_DATA_FRAME_SIZE: usize = 16 * 1024;
