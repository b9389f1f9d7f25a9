use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, warn};

use crate::network::Message;
use crate::service::{MessageSink, Shutdown, SinkDispatcher};
use crate::AppResult;

/// Address reported by connectors that do not listen.
pub const UNBOUND_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Lifecycle contract shared by the server and client connectors.
///
/// All methods take `&self` and may be called concurrently. `start`, `stop`
/// and `destroy` manage a dedicated runtime; `send` never blocks and never
/// reports operational failures, those only show up in the logs.
pub trait Connector: Send + Sync {
    /// Fails with `IllegalStateError` without a sink, when already started
    /// or after `destroy`.
    fn start(&self) -> AppResult<()>;

    /// Closes every connection and stops the worker runtime within the
    /// configured grace period. A later `start` begins from a clean state.
    fn stop(&self);

    /// `stop` and refuse any later `start`.
    fn destroy(&self);

    /// Fire and forget, the payload must already be framed.
    fn send(&self, message: Message) -> AppResult<()>;

    /// Set once, a second registration fails with `IllegalStateError`.
    fn set_message_sink(&self, sink: Arc<dyn MessageSink>) -> AppResult<()>;

    fn local_address(&self) -> SocketAddr;

    fn is_tcp(&self) -> bool {
        true
    }
}

/// Execution resources of one started connector.
///
/// Owns the worker runtime, the shutdown broadcast, the shutdown-complete
/// channel every long lived task holds a sender of, and the sink dispatcher.
#[derive(Debug)]
pub(crate) struct ConnectorRuntime {
    name: &'static str,
    runtime: Runtime,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    dispatcher: SinkDispatcher,
}

impl ConnectorRuntime {
    pub fn build(
        name: &'static str,
        worker_threads: usize,
        sink: Arc<dyn MessageSink>,
        sink_channel_capacity: usize,
    ) -> AppResult<Self> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name(format!("{}-worker", name))
            .enable_all()
            .build()?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let dispatcher = SinkDispatcher::start(name, sink, sink_channel_capacity)?;
        debug!("{} runtime started with {} workers", name, worker_threads);
        Ok(ConnectorRuntime {
            name,
            runtime,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            dispatcher,
        })
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    pub fn notify_shutdown(&self) -> broadcast::Sender<()> {
        self.notify_shutdown.clone()
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    pub fn shutdown_complete_tx(&self) -> mpsc::Sender<()> {
        self.shutdown_complete_tx.clone()
    }

    pub fn dispatcher(&self) -> SinkDispatcher {
        self.dispatcher.clone()
    }

    /// Signals shutdown, waits for every task holding a shutdown-complete
    /// sender to finish, then forcibly drops the rest. Returns within `grace`
    /// plus the time it takes to drop the remaining tasks.
    pub fn shutdown(self, grace: Duration) {
        let ConnectorRuntime {
            name,
            runtime,
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            dispatcher,
        } = self;

        let _ = notify_shutdown.send(());
        drop(shutdown_complete_tx);
        drop(dispatcher);

        if Handle::try_current().is_ok() {
            // blocking is not allowed inside another runtime
            debug!("{} shutting down in the background", name);
            runtime.shutdown_background();
            return;
        }

        let started = Instant::now();
        let completed = runtime.block_on(async {
            time::timeout(grace, shutdown_complete_rx.recv())
                .await
                .is_ok()
        });
        if !completed {
            warn!(
                "{} tasks still running after {:?}, terminating them",
                name, grace
            );
        }
        // the whole stop stays within one grace period
        runtime.shutdown_timeout(grace.saturating_sub(started.elapsed()));
        debug!("{} runtime stopped", name);
    }
}
