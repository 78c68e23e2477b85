//! Link identities and the tunnel names derived from them.
//!
//! A tunnel name is a CIDv1 of the link's ed25519 public key: the key is
//! hashed with sha2-256, wrapped in a multihash, tagged with the
//! `ed25519-pub` multicodec and rendered as lowercase multibase base32.
//! The result is a 61 character DNS label that only depends on the key.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ed25519_dalek::{KEYPAIR_LENGTH, PUBLIC_KEY_LENGTH};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const CID_VERSION: u64 = 1;
/// Multicodec for an ed25519 public key
const ED25519_PUB: u64 = 0xed;
/// Multihash code for sha2-256
const SHA2_256: u64 = 0x12;
const MULTIBASE_BASE32: char = 'b';
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid public key length: {0} bytes (expected {PUBLIC_KEY_LENGTH})")]
    InvalidPublicKey(usize),

    #[error("Invalid private key length: {0} bytes (expected {KEYPAIR_LENGTH})")]
    InvalidPrivateKey(usize),

    #[error("Private key does not match public key")]
    KeyMismatch,

    #[error("Invalid tunnel id: {0:?}")]
    InvalidTunnelId(String),
}

/// Public name of a tunnel, derived from its owner's public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(String);

impl TunnelId {
    /// Derive the tunnel name for a raw ed25519 public key
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, IdentityError> {
        let public_key: &[u8; PUBLIC_KEY_LENGTH] = public_key
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey(public_key.len()))?;
        Ok(Self::derive(public_key))
    }

    fn derive(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> Self {
        let digest = Sha256::digest(public_key);

        let mut cid = Vec::with_capacity(5 + digest.len());
        put_uvarint(&mut cid, CID_VERSION);
        put_uvarint(&mut cid, ED25519_PUB);
        put_uvarint(&mut cid, SHA2_256);
        put_uvarint(&mut cid, digest.len() as u64);
        cid.extend_from_slice(&digest);

        let mut encoded = String::with_capacity(1 + (cid.len() * 8).div_ceil(5));
        encoded.push(MULTIBASE_BASE32);
        encode_base32(&cid, &mut encoded);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TunnelId {
    type Err = IdentityError;

    /// Accepts any lowercase multibase base32 string. The key behind it
    /// cannot be recovered, so this is a syntax check only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() > 1
            && s.starts_with(MULTIBASE_BASE32)
            && s[1..].bytes().all(|c| BASE32_ALPHABET.contains(&c));
        if !valid {
            return Err(IdentityError::InvalidTunnelId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for TunnelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TunnelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Unsigned LEB128, as used by multiformats
fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// RFC 4648 base32, lowercase, no padding
fn encode_base32(data: &[u8], out: &mut String) {
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
}

/// An ed25519 key pair owned by a link
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key pair from its raw parts.
    ///
    /// `private` is the 64-byte form (seed followed by public key); its
    /// public half must match `public`.
    pub fn from_bytes(public: &[u8], private: &[u8]) -> Result<Self, IdentityError> {
        let public: [u8; PUBLIC_KEY_LENGTH] = public
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey(public.len()))?;
        let private: [u8; KEYPAIR_LENGTH] = private
            .try_into()
            .map_err(|_| IdentityError::InvalidPrivateKey(private.len()))?;

        let signing_key =
            SigningKey::from_keypair_bytes(&private).map_err(|_| IdentityError::KeyMismatch)?;
        if signing_key.verifying_key().to_bytes() != public {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(Self { signing_key })
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn private_key(&self) -> [u8; KEYPAIR_LENGTH] {
        self.signing_key.to_keypair_bytes()
    }

    pub fn tunnel_id(&self) -> TunnelId {
        TunnelId::derive(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("tunnel_id", &self.tunnel_id())
            .finish_non_exhaustive()
    }
}

/// Check an ed25519 signature. Malformed keys or signatures verify as false.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::try_from(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
