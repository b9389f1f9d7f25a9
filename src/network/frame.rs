use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::network::Message;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Body lengths up to this value are carried in the length nibble itself.
pub const MAX_INLINE_LENGTH: u64 = 12;
/// Offset added to the 1 byte extended length (nibble 13).
pub const EXTENDED_8_BIT_OFFSET: u64 = 13;
/// Offset added to the 2 byte extended length (nibble 14).
pub const EXTENDED_16_BIT_OFFSET: u64 = 269;
/// Offset added to the 4 byte extended length (nibble 15).
pub const EXTENDED_32_BIT_OFFSET: u64 = 65805;
/// Largest token the 4 bit token length nibble can describe.
pub const MAX_TOKEN_LENGTH: usize = 15;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
// upper bound of a single reservation made on behalf of a frame header,
// a peer announcing a huge body must actually send it before we allocate it
const MAX_RESERVE_AHEAD: usize = 64 * 1024;

/// Number of extended length bytes following the first header byte.
pub fn extended_length_bytes(length_indicator: u8) -> usize {
    match length_indicator {
        0..=12 => 0,
        13 => 1,
        14 => 2,
        _ => 4,
    }
}

/// Total length of the frame at the start of `buffer`, or `None` while the
/// first byte or the extended length bytes are still missing.
fn frame_length(buffer: &[u8]) -> Option<u64> {
    let first = *buffer.first()?;
    let length_indicator = first >> 4;
    let token_length = u64::from(first & 0x0F);
    let extended = extended_length_bytes(length_indicator);
    let ext = buffer.get(1..1 + extended)?;

    let body_length = match length_indicator {
        0..=12 => u64::from(length_indicator),
        13 => u64::from(ext[0]) + EXTENDED_8_BIT_OFFSET,
        14 => u64::from(u16::from_be_bytes([ext[0], ext[1]])) + EXTENDED_16_BIT_OFFSET,
        _ => {
            u64::from(u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]))
                + EXTENDED_32_BIT_OFFSET
        }
    };
    // header byte, extended length, code byte, token, options and payload
    Some(1 + extended as u64 + 1 + token_length + body_length)
}

/// Checks whether `buffer` starts with a complete frame and returns its length.
///
/// Returns `Err(Incomplete)` while more bytes are needed. Nothing else is
/// considered an error here: the contents of code, token and body are opaque.
pub fn check(buffer: &[u8]) -> AppResult<usize> {
    match frame_length(buffer) {
        Some(total) if buffer.len() as u64 >= total => Ok(total as usize),
        _ => Err(Incomplete),
    }
}

/// Per connection incremental decoder.
///
/// Bytes are appended as they arrive, complete frames are split off the front
/// of the buffer, so the front of the buffer is always the read cursor.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
    remote_address: SocketAddr,
}

impl StreamFramer {
    pub fn new(remote_address: SocketAddr) -> Self {
        StreamFramer {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            remote_address,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Receive buffer, socket reads append to it directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes buffered but not yet emitted as part of a message.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn extend_from_slice(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Splits the next complete frame off the buffer.
    ///
    /// Returns `None` when the buffered bytes do not hold a complete frame yet;
    /// partial data is always retained.
    pub fn next_message(&mut self) -> Option<Message> {
        match check(&self.buffer) {
            Ok(total) => {
                let frame = self.buffer.split_to(total).freeze();
                trace!(
                    "framed {} bytes from {}, {} bytes left buffered",
                    total,
                    self.remote_address,
                    self.buffer.len()
                );
                Some(Message::new(frame, self.remote_address))
            }
            Err(_) => {
                if let Some(total) = frame_length(&self.buffer) {
                    let missing = (total - self.buffer.len() as u64).min(MAX_RESERVE_AHEAD as u64);
                    self.buffer.reserve(missing as usize);
                }
                None
            }
        }
    }

    /// Appends `chunk` and drains every message it completes, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message() {
            messages.push(message);
        }
        messages
    }
}

/// Builds one wire frame, the inverse of what [`StreamFramer`] recognizes.
pub fn encode_frame(code: u8, token: &[u8], body: &[u8]) -> AppResult<Bytes> {
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(AppError::InvalidValue(format!(
            "token length {} exceeds {}",
            token.len(),
            MAX_TOKEN_LENGTH
        )));
    }
    let token_length = token.len() as u8;
    let body_length = body.len() as u64;

    let mut buffer = BytesMut::with_capacity(6 + token.len() + body.len());
    if body_length <= MAX_INLINE_LENGTH {
        buffer.put_u8(((body_length as u8) << 4) | token_length);
    } else if body_length < EXTENDED_16_BIT_OFFSET {
        buffer.put_u8((13 << 4) | token_length);
        buffer.put_u8((body_length - EXTENDED_8_BIT_OFFSET) as u8);
    } else if body_length < EXTENDED_32_BIT_OFFSET {
        buffer.put_u8((14 << 4) | token_length);
        buffer.put_u16((body_length - EXTENDED_16_BIT_OFFSET) as u16);
    } else {
        let extended = u32::try_from(body_length - EXTENDED_32_BIT_OFFSET).map_err(|_| {
            AppError::InvalidValue(format!("body length {} is too large", body_length))
        })?;
        buffer.put_u8((15 << 4) | token_length);
        buffer.put_u32(extended);
    }
    buffer.put_u8(code);
    buffer.put_slice(token);
    buffer.put_slice(body);
    Ok(buffer.freeze())
}
