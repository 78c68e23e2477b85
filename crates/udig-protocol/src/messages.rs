use serde::{Deserialize, Serialize};

/// Sent by the broker on the Register stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterTrigger {
    /// Fresh random challenge the link must sign
    pub nonce: Vec<u8>,
}

/// Link's answer to a [`RegisterTrigger`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Raw 32-byte ed25519 public key
    pub ed25519_public_key: Vec<u8>,
    /// Signature of the nonce
    pub signature: Vec<u8>,
    /// Ingress ports the link wants; empty means all enabled ports
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Structured failure reported back to the link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupError {
    /// Machine readable code, e.g. "unauthenticated"
    pub code: String,
    /// Human readable description
    pub message: String,
}

impl SetupError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of a registration, sent by the broker on the Setup stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetupRequest {
    /// Registration was rejected
    Error(SetupError),
    /// Registration succeeded; these are the public addresses
    Ingress(Vec<String>),
}

/// Acknowledgement of a [`SetupRequest`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupResponse {}

/// Metadata carried by the first [`Up`] frame of a tunnel stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpHeader {
    pub tunnel_id: String,
}

/// Broker to link: bytes read from the public connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Up {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<UpHeader>,
    pub data: Vec<u8>,
    /// Public side reached end of input; nothing follows
    #[serde(default)]
    pub finish: bool,
}

/// Link to broker: bytes read from the local service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Down {
    pub data: Vec<u8>,
    /// Local service reached end of input; nothing follows
    #[serde(default)]
    pub finish: bool,
}
