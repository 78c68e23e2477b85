use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame payload accepted in either direction (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON frames
///
/// ```text
/// +-----------------+------------------+
/// | length (u32 BE) | JSON payload     |
/// +-----------------+------------------+
/// ```
///
/// The codec is typed by the message it carries, so each direction of a
/// stream uses its own instance.
pub struct TunnelCodec<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> TunnelCodec<T> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for TunnelCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for TunnelCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = (&src[..LENGTH_PREFIX]).get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let frame_len = LENGTH_PREFIX + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(length);
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<T: Serialize> Encoder<T> for TunnelCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(json.len()));
        }

        dst.reserve(LENGTH_PREFIX + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}
