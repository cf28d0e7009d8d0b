//! Terminal frame wire format.
//!
//! Wire format: `[1-byte ASCII tag][payload]`
//!
//! - `'0'` data passthrough, either direction. Payload is terminal text.
//! - `'1'` viewport resize, client to upstream only. Payload is a JSON
//!   geometry object (`{"columns":80,"rows":24}`).
//!
//! Frames are otherwise opaque to the relay: only the tag byte is inspected.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// Tag byte of a data frame.
pub const TAG_DATA: u8 = b'0';
/// Tag byte of a resize frame.
pub const TAG_RESIZE: u8 = b'1';

/// Classified leading byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Data,
    Resize,
    /// Any other tag; forwarded untouched but never buffered.
    Other(u8),
}

impl FrameTag {
    pub fn from_byte(b: u8) -> Self {
        match b {
            TAG_DATA => FrameTag::Data,
            TAG_RESIZE => FrameTag::Resize,
            other => FrameTag::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FrameTag::Data => TAG_DATA,
            FrameTag::Resize => TAG_RESIZE,
            FrameTag::Other(b) => b,
        }
    }
}

/// A borrowed view of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub tag: FrameTag,
    pub payload: &'a [u8],
}

/// Split a raw frame into tag and payload.
///
/// An empty frame has no tag and is rejected.
pub fn parse(frame: &[u8]) -> RelayResult<FrameRef<'_>> {
    match frame.split_first() {
        Some((&tag, payload)) => Ok(FrameRef {
            tag: FrameTag::from_byte(tag),
            payload,
        }),
        None => Err(RelayError::InvalidFrame("empty frame".into())),
    }
}

/// Build a data frame around `payload`.
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(TAG_DATA);
    frame.extend_from_slice(payload);
    frame
}

/// Terminal viewport geometry carried by resize frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub columns: u16,
    pub rows: u16,
}

/// Build a resize frame for the given geometry.
pub fn encode_resize(geometry: Geometry) -> RelayResult<Vec<u8>> {
    let mut frame = vec![TAG_RESIZE];
    serde_json::to_writer(&mut frame, &geometry)?;
    Ok(frame)
}

/// Decode the payload of a resize frame.
pub fn decode_resize(payload: &[u8]) -> RelayResult<Geometry> {
    let geometry: Geometry = serde_json::from_slice(payload)?;
    if geometry.columns == 0 || geometry.rows == 0 {
        return Err(RelayError::InvalidFrame(format!(
            "degenerate geometry {}x{}",
            geometry.columns, geometry.rows
        )));
    }
    Ok(geometry)
}
