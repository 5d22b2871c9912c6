//! Codec for encoding/decoding envelope frames

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec
///
/// Format: `[length: u32 big-endian][payload: bincode serialized frame]`.
/// `E` is the frame type written, `D` the frame type read, so each side of a
/// stream uses the mirrored pair.
pub struct FrameCodec<E, D> {
    _frames: PhantomData<fn(E) -> D>,
}

impl<E, D> FrameCodec<E, D> {
    /// Length header size
    pub const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self {
            _frames: PhantomData,
        }
    }
}

impl<E, D> Default for FrameCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Serialize, D> Encoder<E> for FrameCodec<E, D> {
    type Error = CodecError;

    fn encode(&mut self, frame: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

impl<E, D: DeserializeOwned> Decoder for FrameCodec<E, D> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, Self::Error> {
        // Need the full length header first
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length);

        Ok(Some(bincode::deserialize(&payload)?))
    }
}
