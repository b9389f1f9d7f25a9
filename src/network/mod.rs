//! Network Module Implementation
//!
//! Byte level plumbing shared by both connectors: message boundaries are
//! recovered from the TCP stream here, and every connection is driven by the
//! same handler regardless of who opened it.
//!
//! # Components
//!
//! - `Message`: opaque framed bytes plus the remote peer address
//! - `StreamFramer`: incremental decoder of the variable length header format
//! - `IdleReaper`: per connection inactivity deadline
//! - `Connection`: read half of a socket feeding its own framer
//! - `ConnectionHandler`: idle detection, framing and dispatch for inbound
//!   bytes, serialized writes for outbound payloads
//!
//! # Wire format
//!
//! ```text
//! byte0: high nibble L = length indicator, low nibble T = token length
//! L 0..=12  body length L,                 no extended bytes
//! L 13      1 extended byte  E, body length E + 13
//! L 14      2 extended bytes E, body length E + 269   (big endian)
//! L 15      4 extended bytes E, body length E + 65805 (big endian)
//! then 1 code byte, T token bytes, body length bytes of options and payload
//! ```

pub use connection::Connection;
pub use frame::{check, encode_frame, extended_length_bytes, StreamFramer};
pub use handler::{CloseReason, ConnectionHandler};
pub use idle::IdleReaper;
pub use message::Message;

mod connection;
mod frame;
mod handler;
mod idle;
mod message;
