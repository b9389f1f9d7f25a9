use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::network::Message;
use crate::service::connector::{ConnectorRuntime, UNBOUND_ADDRESS};
use crate::service::{ClientConfig, ConnectionPool, Connector, MessageSink};
use crate::{AppError, AppResult};

/// Dials outbound connections on demand and keeps one per destination.
///
/// The client can send and receive over the connections it opened, it never
/// accepts any.
pub struct TcpClientConnector {
    config: ClientConfig,
    sink: OnceLock<Arc<dyn MessageSink>>,
    state: RwLock<ClientState>,
}

#[derive(Default)]
struct ClientState {
    running: Option<RunningClient>,
    destroyed: bool,
}

struct RunningClient {
    runtime: ConnectorRuntime,
    pool: Arc<ConnectionPool>,
}

impl TcpClientConnector {
    pub fn new(config: ClientConfig) -> Self {
        TcpClientConnector {
            config,
            sink: OnceLock::new(),
            state: RwLock::new(ClientState::default()),
        }
    }

    /// Destinations that currently own a pool slot.
    pub fn pool_size(&self) -> usize {
        self.state
            .read()
            .running
            .as_ref()
            .map_or(0, |running| running.pool.len())
    }

    pub fn is_connected(&self, remote_address: &SocketAddr) -> bool {
        self.state
            .read()
            .running
            .as_ref()
            .is_some_and(|running| running.pool.contains(remote_address))
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running.is_some()
    }
}

impl Connector for TcpClientConnector {
    fn start(&self) -> AppResult<()> {
        let sink = self.sink.get().cloned().ok_or_else(|| {
            AppError::IllegalStateError("Cannot start without message sink.".to_string())
        })?;
        let mut state = self.state.write();
        if state.destroyed {
            return Err(AppError::IllegalStateError(
                "Connector already destroyed".to_string(),
            ));
        }
        if state.running.is_some() {
            return Err(AppError::IllegalStateError(
                "Connector already started".to_string(),
            ));
        }

        let runtime = ConnectorRuntime::build(
            "tcp-client",
            self.config.worker_threads(),
            sink,
            self.config.sink_channel_capacity,
        )?;
        let pool = Arc::new(ConnectionPool::new(
            runtime.handle().clone(),
            self.config.connect_timeout(),
            self.config.idle_timeout(),
            runtime.dispatcher(),
            runtime.notify_shutdown(),
            runtime.shutdown_complete_tx(),
        ));
        info!(
            "tcp client started, connect timeout {:?}, idle timeout {:?}",
            self.config.connect_timeout(),
            self.config.idle_timeout()
        );
        state.running = Some(RunningClient { runtime, pool });
        Ok(())
    }

    fn stop(&self) {
        let running = self.state.write().running.take();
        let Some(RunningClient { runtime, pool }) = running else {
            debug!("tcp client not running, nothing to stop");
            return;
        };
        pool.close();
        // slot tasks hold the remaining references, they finish on shutdown
        drop(pool);
        runtime.shutdown(self.config.shutdown_grace());
        info!("tcp client stopped");
    }

    fn destroy(&self) {
        self.stop();
        self.state.write().destroyed = true;
    }

    fn send(&self, message: Message) -> AppResult<()> {
        if self.sink.get().is_none() {
            return Err(AppError::IllegalStateError(
                "Cannot send without message sink.".to_string(),
            ));
        }
        let pool = self
            .state
            .read()
            .running
            .as_ref()
            .map(|running| Arc::clone(&running.pool))
            .ok_or_else(|| AppError::IllegalStateError("Connector not started".to_string()))?;
        pool.submit(message);
        Ok(())
    }

    fn set_message_sink(&self, sink: Arc<dyn MessageSink>) -> AppResult<()> {
        self.sink
            .set(sink)
            .map_err(|_| AppError::IllegalStateError("Message sink already set".to_string()))
    }

    /// A client does not bind, the address is always unspecified with port 0.
    fn local_address(&self) -> SocketAddr {
        UNBOUND_ADDRESS
    }
}

impl Drop for TcpClientConnector {
    fn drop(&mut self) {
        self.stop();
        debug!("tcp client dropped");
    }
}
