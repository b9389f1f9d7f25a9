use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Settings of the listening side.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// 0 disables idle detection
    pub idle_timeout_ms: u64,
    /// 0 means one worker per cpu
    pub worker_threads: usize,
    pub sink_channel_capacity: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "0.0.0.0".to_string(),
            port: 5683,
            idle_timeout_ms: 100_000,
            worker_threads: 1,
            sink_channel_capacity: 1024,
            shutdown_grace_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Loopback listener on an ephemeral port.
    pub fn ephemeral(idle_timeout_ms: u64) -> Self {
        ServerConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            idle_timeout_ms,
            ..Default::default()
        }
    }

    pub fn bind_address(&self) -> AppResult<SocketAddr> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| AppError::InvalidValue(format!("server.ip: {}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        duration_or_disabled(self.idle_timeout_ms)
    }

    pub fn worker_threads(&self) -> usize {
        worker_threads_or_cpus(self.worker_threads)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.bind_address()?;
        if self.sink_channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "server.sink_channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the dialing side.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// 0 means one worker per cpu
    pub worker_threads: usize,
    pub connect_timeout_ms: u64,
    /// 0 disables idle detection
    pub idle_timeout_ms: u64,
    pub sink_channel_capacity: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            worker_threads: 1,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 100_000,
            sink_channel_capacity: 1024,
            shutdown_grace_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        duration_or_disabled(self.idle_timeout_ms)
    }

    pub fn worker_threads(&self) -> usize {
        worker_threads_or_cpus(self.worker_threads)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.connect_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "client.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.sink_channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "client.sink_channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_or_disabled(millis: u64) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis))
    }
}

fn worker_threads_or_cpus(configured: usize) -> usize {
    if configured == 0 {
        num_cpus::get()
    } else {
        configured
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl ConnectorConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ConnectorConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = ::config::Config::builder()
            .add_source(::config::File::with_name(path_str))
            .build()?;

        let connector_config: ConnectorConfig = config.try_deserialize()?;
        connector_config.server.validate()?;
        connector_config.client.validate()?;

        Ok(connector_config)
    }
}
