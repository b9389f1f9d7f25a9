pub mod network;
pub mod service;

pub use network::{encode_frame, Message, StreamFramer};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, ConnectorConfig,
    Connector, MessageSink, ServerConfig, TcpClientConnector, TcpServerConnector,
    UNBOUND_ADDRESS,
};
