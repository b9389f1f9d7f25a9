use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tcp_connector::{
    encode_frame, setup_tracing, AppError, AppResult, ClientConfig, ConnectorConfig, Connector,
    Message, TcpClientConnector, TcpServerConnector,
};
use tokio::runtime;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// run the server connector and echo every message back to its sender
    Serve,
    /// frame a payload, send it with the client connector and print the replies
    Send {
        #[arg(long)]
        to: SocketAddr,
        #[arg(long, default_value_t = 1)]
        code: u8,
        /// token as hex, at most 15 bytes
        #[arg(long, default_value = "")]
        token: String,
        /// how long to wait for replies
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
        payload: String,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _tracing_guard = setup_tracing(&commandline.log_dir);

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = if config_path.exists() {
        ConnectorConfig::set_up_config(&config_path)?
    } else {
        warn!("{} not found, using default config", config_path.display());
        ConnectorConfig::default()
    };

    match commandline.command {
        Command::Serve => serve(config),
        Command::Send {
            to,
            code,
            token,
            wait_ms,
            payload,
        } => {
            let token = decode_hex(&token)?;
            let frame = encode_frame(code, &token, payload.as_bytes())?;
            send(config.client, Message::new(frame, to), Duration::from_millis(wait_ms))
        }
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

fn serve(config: ConnectorConfig) -> AppResult<()> {
    let server = Arc::new(TcpServerConnector::new(config.server));

    // the sink replies through the server, a weak reference avoids a cycle
    let weak: Weak<TcpServerConnector> = Arc::downgrade(&server);
    server.set_message_sink(Arc::new(move |message: Message| {
        if let Some(server) = weak.upgrade() {
            info!(
                "echo {} bytes to {}",
                message.len(),
                message.remote_address()
            );
            if let Err(err) = server.send(message) {
                warn!("echo failed: {}", err);
            }
        }
    }))?;
    server.start()?;
    println!("listening on {}", server.local_address());

    // only used to wait for ctrl-c
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(tokio::signal::ctrl_c())?;
    info!("get shutdown signal");

    server.stop();
    Ok(())
}

fn send(config: ClientConfig, message: Message, wait: Duration) -> AppResult<()> {
    let client = TcpClientConnector::new(config);
    let (reply_tx, reply_rx) = mpsc::channel();
    let reply_tx = parking_lot::Mutex::new(reply_tx);
    client.set_message_sink(Arc::new(move |message: Message| {
        let _ = reply_tx.lock().send(message);
    }))?;
    client.start()?;

    println!(
        "sending {} bytes to {}",
        message.len(),
        message.remote_address()
    );
    client.send(message)?;

    while let Ok(reply) = reply_rx.recv_timeout(wait) {
        println!(
            "reply from {}: {:02x?}",
            reply.remote_address(),
            &reply.payload()[..]
        );
    }

    client.stop();
    Ok(())
}

fn decode_hex(hex: &str) -> AppResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(AppError::InvalidValue(format!("odd length hex: {}", hex)));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| AppError::InvalidValue(format!("invalid hex: {}", hex)))
        })
        .collect()
}
