// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, warn};

use crate::network::{CloseReason, ConnectionHandler, Message};
use crate::service::{Shutdown, SinkDispatcher};
use crate::{AppError, AppResult};

// a slot that is being evicted may refuse one payload, the retry lands on a fresh slot
const SUBMIT_ATTEMPTS: usize = 2;

#[derive(Debug)]
struct PoolSlot {
    id: u64,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

/// Outbound connections of a client connector, at most one per destination.
///
/// Every slot is a task that owns the destination's outbound queue and, once
/// dialed, its single connection. Payloads for one destination are therefore
/// written one after another over the same connection. A slot removes itself
/// from the map when its connection ends (idle, error, peer close) or its dial
/// fails; payloads still queued at that point are handed to a fresh slot.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: DashMap<SocketAddr, PoolSlot>,
    next_slot_id: AtomicU64,
    closed: AtomicBool,
    handle: Handle,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    dispatcher: SinkDispatcher,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionPool {
    pub fn new(
        handle: Handle,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
        dispatcher: SinkDispatcher,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        ConnectionPool {
            slots: DashMap::new(),
            next_slot_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            handle,
            connect_timeout,
            idle_timeout,
            dispatcher,
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Queues the message on its destination's slot, creating the slot if needed.
    pub fn submit(self: &Arc<Self>, message: Message) {
        let remote_address = message.remote_address();
        let mut payload = message.into_payload();

        for _ in 0..SUBMIT_ATTEMPTS {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let (id, outbound_tx) = {
                let slot = self
                    .slots
                    .entry(remote_address)
                    .or_insert_with(|| self.open_slot(remote_address));
                (slot.id, slot.outbound_tx.clone())
            };
            match outbound_tx.send(payload) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // the slot closed its queue while evicting itself
                    self.slots.remove_if(&remote_address, |_, slot| slot.id == id);
                    payload = returned;
                }
            }
        }
        warn!(
            "dropping {} bytes for {}, no connection slot available",
            payload.len(),
            remote_address
        );
    }

    /// Number of destinations with a slot, dialing or connected.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, remote_address: &SocketAddr) -> bool {
        self.slots.contains_key(remote_address)
    }

    /// Stops accepting payloads and closes every slot's queue.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.clear();
    }

    fn open_slot(self: &Arc<Self>, remote_address: SocketAddr) -> PoolSlot {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::clone(self);
        self.handle
            .spawn(async move { pool.run_slot(remote_address, id, outbound_rx).await });
        debug!("opened pool slot {} for {}", id, remote_address);
        PoolSlot { id, outbound_tx }
    }

    async fn run_slot(
        self: Arc<Self>,
        remote_address: SocketAddr,
        id: u64,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());

        let first = tokio::select! {
            payload = outbound_rx.recv() => payload,
            _ = shutdown.recv() => None,
        };
        if let Some(first) = first {
            let dialed = tokio::select! {
                dialed = self.dial(remote_address) => Some(dialed),
                _ = shutdown.recv() => None,
            };
            match dialed {
                Some(Ok(socket)) => {
                    let mut handler = ConnectionHandler::new(
                        socket,
                        remote_address,
                        self.idle_timeout,
                        self.dispatcher.clone(),
                        shutdown,
                    );
                    let result = match handler.write(&first).await {
                        Ok(()) => handler.run(&mut outbound_rx).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(CloseReason::Idle) => {
                            debug!("evicting idle connection to {}", remote_address)
                        }
                        Ok(reason) => {
                            debug!("connection to {} closed: {:?}", remote_address, reason)
                        }
                        Err(err) => warn!("connection to {} failed: {}", remote_address, err),
                    }
                }
                Some(Err(err)) => {
                    warn!("unable to open connection to {}: {}", remote_address, err);
                }
                None => {}
            }
        }
        self.evict(remote_address, id, outbound_rx);
    }

    async fn dial(&self, remote_address: SocketAddr) -> AppResult<TcpStream> {
        match time::timeout(self.connect_timeout, TcpStream::connect(remote_address)).await {
            Ok(Ok(socket)) => {
                socket.set_nodelay(true)?;
                debug!("connected to {}", remote_address);
                Ok(socket)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(AppError::ConnectTimeout(remote_address.to_string())),
        }
    }

    fn evict(
        self: &Arc<Self>,
        remote_address: SocketAddr,
        id: u64,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        self.slots.remove_if(&remote_address, |_, slot| slot.id == id);
        outbound_rx.close();

        let mut pending = Vec::new();
        while let Ok(payload) = outbound_rx.try_recv() {
            pending.push(payload);
        }
        debug!(
            "evicted pool slot {} for {}, {} payloads pending",
            id,
            remote_address,
            pending.len()
        );
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for payload in pending {
            self.submit(Message::new(payload, remote_address));
        }
    }
}
