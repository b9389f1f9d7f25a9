use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::network::{Message, StreamFramer};
use crate::AppResult;

/// Read side of a connection.
///
/// Socket reads land directly in the framer's buffer, complete messages are
/// then taken out one by one with [`Connection::next_message`].
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    framer: StreamFramer,
}

impl Connection {
    pub fn new(reader: OwnedReadHalf, remote_address: SocketAddr) -> Connection {
        Connection {
            reader,
            framer: StreamFramer::new(remote_address),
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.framer.remote_address()
    }

    /// Reads whatever the socket has, returns the number of bytes read.
    ///
    /// 0 means the peer closed its write side. Cancel safe, a read that did
    /// not complete leaves the buffer untouched.
    pub async fn read_chunk(&mut self) -> AppResult<usize> {
        let read = self.reader.read_buf(self.framer.buffer_mut()).await?;
        Ok(read)
    }

    pub fn next_message(&mut self) -> Option<Message> {
        self.framer.next_message()
    }

    /// Bytes of an unfinished frame still held in the buffer.
    pub fn buffered_len(&self) -> usize {
        self.framer.buffered_len()
    }
}
