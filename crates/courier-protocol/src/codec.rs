//! Codec for encoding and decoding Courier envelopes.
//!
//! Envelopes travel as UTF-8 JSON text, one envelope per transport message.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A known event kind carried a payload of the wrong shape.
    #[error("Invalid payload for event {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode an envelope to JSON bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_limited(data, MAX_FRAME_SIZE)
}

/// Decode an envelope, rejecting input larger than `limit` bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid envelope.
pub fn decode_limited(data: &[u8], limit: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            limit,
        });
    }

    Ok(serde_json::from_slice(data)?)
}
