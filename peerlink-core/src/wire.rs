//! Application framing: length-prefix (4 bytes LE) + CBOR payload.
//! Frames are self-delimiting in a continuous byte stream; chunk boundaries carry no meaning.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + CBOR payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = vec![0u8; LEN_SIZE];
    ciborium::into_writer(value, &mut out).map_err(|e| FrameEncodeError::Encode(e.to_string()))?;
    let payload_len = out.len() - LEN_SIZE;
    if payload_len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    out[..LEN_SIZE].copy_from_slice(&(payload_len as u32).to_le_bytes());
    Ok(out)
}

/// Error encoding a value into a frame (CBOR or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    let value = ciborium::from_reader(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(|e| FrameDecodeError::Decode(e.to_string()))?;
    Ok((value, LEN_SIZE + len))
}

fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok(len)
}

/// Error decoding a frame (need more bytes, too large, or CBOR failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(String),
}

/// Streaming decoder: feed chunks in arrival order, pull whole values out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete value, `Ok(None)` if the buffer holds only a partial frame.
    /// A frame that fails to decode is consumed and reported; an oversized length prefix
    /// cannot be resynchronized, so the buffer is discarded.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameDecodeError> {
        let len = match frame_len(&self.buf) {
            Ok(len) => len,
            Err(FrameDecodeError::NeedMore) => return Ok(None),
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };
        let frame = self.buf.split_to(LEN_SIZE + len);
        let value = ciborium::from_reader(&frame[LEN_SIZE..])
            .map_err(|e| FrameDecodeError::Decode(e.to_string()))?;
        Ok(Some(value))
    }

    /// Bytes held for a frame that is not yet complete.
    pub fn pending(&self) -> usize {
        self.buf.remaining()
    }
}
