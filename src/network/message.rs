use std::net::SocketAddr;

use bytes::Bytes;

/// One framed message and the peer it came from (inbound) or goes to (outbound).
///
/// The payload is opaque: header, code, token and body exactly as they travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    remote_address: SocketAddr,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, remote_address: SocketAddr) -> Self {
        Message {
            payload: payload.into(),
            remote_address,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
