use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::network::{CloseReason, ConnectionHandler, Message};
use crate::service::connector::{ConnectorRuntime, UNBOUND_ADDRESS};
use crate::service::{
    ConnectionRegistry, Connector, MessageSink, ServerConfig, Shutdown, SinkDispatcher,
};
use crate::{AppError, AppResult};

/// Accepts inbound connections and lets the sink reply over them.
///
/// A server never dials: `send` only reaches peers that currently hold an
/// open connection to it.
pub struct TcpServerConnector {
    config: ServerConfig,
    sink: OnceLock<Arc<dyn MessageSink>>,
    registry: Arc<ConnectionRegistry>,
    state: RwLock<ServerState>,
}

#[derive(Default)]
struct ServerState {
    running: Option<RunningServer>,
    destroyed: bool,
}

struct RunningServer {
    runtime: ConnectorRuntime,
    local_address: SocketAddr,
}

impl TcpServerConnector {
    pub fn new(config: ServerConfig) -> Self {
        TcpServerConnector {
            config,
            sink: OnceLock::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            state: RwLock::new(ServerState::default()),
        }
    }

    /// Number of currently registered inbound connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, remote_address: &SocketAddr) -> bool {
        self.registry.contains(remote_address)
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running.is_some()
    }

    fn bind(&self) -> AppResult<std::net::TcpListener> {
        let listen_address = self.config.bind_address()?;
        let listener = std::net::TcpListener::bind(listen_address).map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl Connector for TcpServerConnector {
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

        let listener = self.bind()?;
        let local_address = listener.local_addr()?;
        let runtime = ConnectorRuntime::build(
            "tcp-server",
            self.config.worker_threads(),
            sink,
            self.config.sink_channel_capacity,
        )?;
        let listener = {
            let _guard = runtime.handle().enter();
            TcpListener::from_std(listener)?
        };

        let acceptor = Acceptor {
            listener,
            registry: Arc::clone(&self.registry),
            idle_timeout: self.config.idle_timeout(),
            dispatcher: runtime.dispatcher(),
            notify_shutdown: runtime.notify_shutdown(),
            shutdown_complete_tx: runtime.shutdown_complete_tx(),
        };
        let shutdown = runtime.shutdown_signal();
        runtime.handle().spawn(async move {
            if let Err(err) = acceptor.run(shutdown).await {
                error!(cause = %err, "failed to accept");
            }
        });
        info!("tcp server binding to {} for listening", local_address);

        state.running = Some(RunningServer {
            runtime,
            local_address,
        });
        Ok(())
    }

    fn stop(&self) {
        let running = self.state.write().running.take();
        let Some(running) = running else {
            debug!("tcp server not running, nothing to stop");
            return;
        };
        // dropping the outbound senders closes every registered connection
        self.registry.clear();
        running.runtime.shutdown(self.config.shutdown_grace());
        info!("tcp server on {} stopped", running.local_address);
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
        if self.state.read().running.is_none() {
            return Err(AppError::IllegalStateError(
                "Connector not started".to_string(),
            ));
        }
        let remote_address = message.remote_address();
        if !self.registry.send(message) {
            warn!(
                "Attempting to send message to an address without an active connection {}",
                remote_address
            );
        }
        Ok(())
    }

    fn set_message_sink(&self, sink: Arc<dyn MessageSink>) -> AppResult<()> {
        self.sink
            .set(sink)
            .map_err(|_| AppError::IllegalStateError("Message sink already set".to_string()))
    }

    fn local_address(&self) -> SocketAddr {
        if let Some(running) = &self.state.read().running {
            return running.local_address;
        }
        self.config.bind_address().unwrap_or(UNBOUND_ADDRESS)
    }
}

impl Drop for TcpServerConnector {
    fn drop(&mut self) {
        self.stop();
        debug!("tcp server dropped");
    }
}

struct Acceptor {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Option<Duration>,
    dispatcher: SinkDispatcher,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    /// Accepts connections until shutdown, each one handled by its own task.
    ///
    /// Per connection: register the peer, run idle detection, framing and
    /// dispatch, deregister on whatever path the handler exits.
    async fn run(&self, mut shutdown: Shutdown) -> AppResult<()> {
        loop {
            let (socket, remote_address) = tokio::select! {
                accepted = self.accept() => accepted?,
                _ = shutdown.recv() => {
                    debug!("acceptor exit after recv shutdown signal");
                    return Ok(());
                }
            };
            debug!("accept new connection from {}", remote_address);

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
            let registration = self.registry.register(remote_address, outbound_tx);
            let mut handler = ConnectionHandler::new(
                socket,
                remote_address,
                self.idle_timeout,
                self.dispatcher.clone(),
                Shutdown::new(self.notify_shutdown.subscribe()),
            );
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();

            tokio::spawn(async move {
                match handler.run(&mut outbound_rx).await {
                    Ok(CloseReason::Idle) => {
                        debug!("closing idle connection from {}", remote_address)
                    }
                    Ok(reason) => {
                        debug!("connection from {} closed: {:?}", remote_address, reason)
                    }
                    Err(err) => warn!("connection from {} error: {}", remote_address, err),
                }
                // whether gracefully or unexpectedly closed, deregister the peer
                drop(registration);
                drop(shutdown_complete_tx);
            });
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept error: {}, retry in {}s", err, backoff);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
