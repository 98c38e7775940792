//! Binary framing for the tunnel wire protocol.
//!
//! Header layout, network byte order: `[type:1][stream_id:4][payload_len:4]`,
//! followed by `payload_len` bytes. The transport preserves message
//! boundaries, so one WebSocket binary message carries exactly one frame.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size per frame (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Frame types carried on the wire.
///
/// `AuthChallenge` and `AuthResponse` are reserved for a future in-band
/// handshake; they are never produced today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    HttpRequest = 1,
    HttpResponse = 2,
    BodyChunk = 3,
    StreamClose = 4,
    Ping = 5,
    Pong = 6,
    AuthChallenge = 7,
    AuthResponse = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::HttpRequest),
            2 => Ok(FrameType::HttpResponse),
            3 => Ok(FrameType::BodyChunk),
            4 => Ok(FrameType::StreamClose),
            5 => Ok(FrameType::Ping),
            6 => Ok(FrameType::Pong),
            7 => Ok(FrameType::AuthChallenge),
            8 => Ok(FrameType::AuthResponse),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// A single wire-protocol frame.
///
/// Stream id zero is reserved for connection-scoped frames (ping/pong);
/// nonzero ids identify one request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A connection-scoped frame on stream zero with no payload.
    pub fn control(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            stream_id: 0,
            payload: Vec::new(),
        }
    }

    /// The terminal frame for a stream.
    pub fn stream_close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::StreamClose,
            stream_id,
            payload: Vec::new(),
        }
    }
}

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),
    #[error("buffer too small for header: {0} bytes")]
    HeaderTooShort(usize),
    #[error("data too short: have {have}, need {need}")]
    Truncated { have: usize, need: usize },
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
}

/// Serialise a frame into bytes (header + payload).
pub fn marshal(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(frame.payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    buf.push(frame.frame_type as u8);
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Deserialise bytes into a frame.
pub fn unmarshal(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::HeaderTooShort(data.len()));
    }
    let frame_type = FrameType::try_from(data[0])?;
    let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let payload_len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    let need = HEADER_SIZE + payload_len;
    if data.len() < need {
        return Err(FrameError::Truncated {
            have: data.len(),
            need,
        });
    }
    Ok(Frame {
        frame_type,
        stream_id,
        payload: data[HEADER_SIZE..need].to_vec(),
    })
}

static STREAM_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Next stream identifier from the process-wide monotonic counter.
///
/// Ids only need to be unique over one link's lifetime, so a fresh counter
/// per process is enough.
pub fn next_stream_id() -> u32 {
    STREAM_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Split a payload into frames respecting [`MAX_PAYLOAD_SIZE`].
///
/// The first frame carries `first_type`; continuation frames carry
/// [`FrameType::BodyChunk`]. An empty payload still yields one frame.
pub fn chunk_payload(stream_id: u32, first_type: FrameType, payload: &[u8]) -> Vec<Frame> {
    if payload.len() <= MAX_PAYLOAD_SIZE {
        return vec![Frame {
            frame_type: first_type,
            stream_id,
            payload: payload.to_vec(),
        }];
    }
    payload
        .chunks(MAX_PAYLOAD_SIZE)
        .enumerate()
        .map(|(i, chunk)| Frame {
            frame_type: if i == 0 { first_type } else { FrameType::BodyChunk },
            stream_id,
            payload: chunk.to_vec(),
        })
        .collect()
}
