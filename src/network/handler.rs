use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::network::{Connection, IdleReaper};
use crate::service::{Shutdown, SinkDispatcher};
use crate::{AppError, AppResult};

/// Why a connection handler stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// peer closed its side of the stream
    PeerClosed,
    /// no read or write within the idle timeout
    Idle,
    /// the owning connector is stopping
    Shutdown,
    /// every outbound sender was dropped, nobody can write to us anymore
    OutboundClosed,
}

/// Drives one connection for either connector.
///
/// Inbound bytes pass the stages in order: the idle reaper records activity,
/// the framer cuts complete messages, the dispatcher hands them to the sink.
/// Outbound payloads come from a queue and are written one at a time, which
/// serializes every writer of this connection.
#[derive(Debug)]
pub struct ConnectionHandler {
    connection: Connection,
    writer: BufWriter<OwnedWriteHalf>,
    reaper: IdleReaper,
    dispatcher: SinkDispatcher,
    shutdown: Shutdown,
}

impl ConnectionHandler {
    pub fn new(
        socket: TcpStream,
        remote_address: SocketAddr,
        idle_timeout: Option<Duration>,
        dispatcher: SinkDispatcher,
        shutdown: Shutdown,
    ) -> Self {
        let (reader, writer) = socket.into_split();
        ConnectionHandler {
            connection: Connection::new(reader, remote_address),
            writer: BufWriter::new(writer),
            reaper: IdleReaper::new(idle_timeout),
            dispatcher,
            shutdown,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Runs until the connection is closed for one of the [`CloseReason`]s.
    ///
    /// I/O failures are returned as errors; in every case the socket is
    /// released when the handler is dropped.
    pub async fn run(
        &mut self,
        outbound: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> AppResult<CloseReason> {
        loop {
            tokio::select! {
                read = self.connection.read_chunk() => {
                    if read? == 0 {
                        if self.connection.buffered_len() > 0 {
                            debug!(
                                "peer {} closed with {} bytes of an unfinished frame",
                                self.remote_address(),
                                self.connection.buffered_len()
                            );
                        }
                        return Ok(CloseReason::PeerClosed);
                    }
                    self.reaper.touch();
                    // every complete frame of this chunk goes out before the next read
                    while let Some(message) = self.connection.next_message() {
                        self.dispatcher.dispatch(message).await?;
                    }
                }
                payload = outbound.recv() => {
                    match payload {
                        Some(payload) => self.write(&payload).await?,
                        None => return Ok(CloseReason::OutboundClosed),
                    }
                }
                _ = self.reaper.expired() => {
                    return Ok(CloseReason::Idle);
                }
                _ = self.shutdown.recv() => {
                    return Ok(CloseReason::Shutdown);
                }
            }
        }
    }

    /// Writes one already framed payload and flushes it.
    pub async fn write(&mut self, payload: &[u8]) -> AppResult<()> {
        self.writer.write_all(payload).await.map_err(|e| {
            AppError::DetailedIoError(format!(
                "write to {} error: {}",
                self.connection.remote_address(),
                e
            ))
        })?;
        self.writer.flush().await.map_err(|e| {
            AppError::DetailedIoError(format!(
                "flush to {} error: {}",
                self.connection.remote_address(),
                e
            ))
        })?;
        self.reaper.touch();
        trace!("wrote {} bytes to {}", payload.len(), self.remote_address());
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler for {} dropped", self.remote_address());
    }
}
