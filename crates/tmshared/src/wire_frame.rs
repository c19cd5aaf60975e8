//
// wire_frame.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Codec between structured Jupyter messages and the frames that travel over
//! the kernel WebSocket.
//!
//! A message without binary buffers is a single JSON text frame. A message
//! with buffers is a binary frame laid out as:
//!
//! ```text
//! u32 LE n (buffer count)
//! u32 LE offsets[0..=n] (byte positions: JSON body, then each buffer)
//! JSON body
//! buffers, in declared order
//! ```
//!
//! The end of the last buffer is implicitly the frame length.

use bytes::Bytes;
use thiserror::Error;

use crate::jupyter_message::JupyterMessage;

/// A frame ready to be sent over the WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// A JSON text frame; used when the message carries no binary buffers
    Text(String),

    /// A binary frame with an offset table and a binary tail
    Binary(Vec<u8>),
}

/// The ways a wire frame can fail to decode.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("binary frame too short for its offset table ({0} bytes)")]
    Truncated(usize),

    #[error("offset table is not monotone at entry {0}")]
    NonMonotone(usize),

    #[error("offset {offset} exceeds frame length {len}")]
    OutOfBounds { offset: u32, len: usize },

    #[error("JSON body offset {0} overlaps the offset table")]
    BodyOverlapsTable(u32),

    #[error("malformed JSON body: {0}")]
    BadJson(#[from] serde_json::Error),
}

/// Encode a message as a wire frame.
pub fn encode(msg: &JupyterMessage) -> Result<WireFrame, FrameError> {
    if msg.buffers.is_empty() {
        return Ok(WireFrame::Text(serde_json::to_string(msg)?));
    }

    let body = serde_json::to_vec(msg)?;
    let n = msg.buffers.len();

    // Count word plus n + 1 offset words
    let table_len = 4 * (n + 2);

    let mut offsets = Vec::with_capacity(n + 1);
    offsets.push(table_len as u32);
    let mut pos = table_len + body.len();
    for buffer in &msg.buffers {
        offsets.push(pos as u32);
        pos += buffer.len();
    }

    let mut frame = Vec::with_capacity(pos);
    frame.extend_from_slice(&(n as u32).to_le_bytes());
    for offset in &offsets {
        frame.extend_from_slice(&offset.to_le_bytes());
    }
    frame.extend_from_slice(&body);
    for buffer in &msg.buffers {
        frame.extend_from_slice(buffer);
    }

    Ok(WireFrame::Binary(frame))
}

/// Decode a JSON text frame.
pub fn decode_text(data: &str) -> Result<JupyterMessage, FrameError> {
    Ok(serde_json::from_str(data)?)
}

/// Decode a binary frame.
pub fn decode_binary(data: &[u8]) -> Result<JupyterMessage, FrameError> {
    if data.len() < 8 {
        return Err(FrameError::Truncated(data.len()));
    }

    let n = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let table_len = n
        .checked_add(2)
        .and_then(|words| words.checked_mul(4))
        .ok_or(FrameError::Truncated(data.len()))?;
    if data.len() < table_len {
        return Err(FrameError::Truncated(data.len()));
    }

    let mut offsets = Vec::with_capacity(n + 1);
    for i in 0..=n {
        let start = 4 + i * 4;
        offsets.push(u32::from_le_bytes(
            data[start..start + 4].try_into().unwrap(),
        ));
    }

    // The body must start past the offset table, offsets must be monotone,
    // and every offset must lie within the frame.
    if (offsets[0] as usize) < table_len {
        return Err(FrameError::BodyOverlapsTable(offsets[0]));
    }
    for (i, offset) in offsets.iter().enumerate() {
        if *offset as usize > data.len() {
            return Err(FrameError::OutOfBounds {
                offset: *offset,
                len: data.len(),
            });
        }
        if i > 0 && *offset < offsets[i - 1] {
            return Err(FrameError::NonMonotone(i));
        }
    }

    let body_start = offsets[0] as usize;
    let body_end = if n == 0 {
        data.len()
    } else {
        offsets[1] as usize
    };
    let mut msg: JupyterMessage = serde_json::from_slice(&data[body_start..body_end])?;

    let mut buffers = Vec::with_capacity(n);
    for i in 1..=n {
        let start = offsets[i] as usize;
        let end = if i == n {
            data.len()
        } else {
            offsets[i + 1] as usize
        };
        buffers.push(Bytes::copy_from_slice(&data[start..end]));
    }
    msg.buffers = buffers;

    Ok(msg)
}
