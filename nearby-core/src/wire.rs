//! Framing: length-prefix (4 bytes LE) + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

const LEN_SIZE: usize = 4;

/// Largest accepted payload. Events and actions are small; a roster of a few
/// hundred peers stays far below this.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// `NeedMore` means the buffer holds only part of a frame; retry once more bytes arrive.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let len = match frame_len(bytes)? {
        Some(len) => len,
        None => return Err(FrameDecodeError::NeedMore),
    };
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Payload length announced by the prefix, once the prefix is complete.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(Some(len as usize))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
