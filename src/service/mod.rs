pub use app_error::{AppError, AppResult};
pub use client::TcpClientConnector;
pub use config::{ClientConfig, ConnectorConfig, ServerConfig};
pub use connector::{Connector, UNBOUND_ADDRESS};
pub use pool::ConnectionPool;
pub use registry::{ConnectionRegistry, Registration};
pub use server::TcpServerConnector;
pub use shutdown::Shutdown;
pub use sink::{MessageSink, SinkDispatcher};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod client;
mod config;
mod connector;
mod pool;
mod registry;
mod server;
mod shutdown;
mod sink;
mod tracing_config;
