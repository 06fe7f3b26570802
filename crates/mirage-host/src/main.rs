use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

mod config;
mod control;
mod encoder;
mod handshake;
mod session;

use config::HostConfig;
use control::{LogInputSink, handle_connection};
use handshake::{HelloValidator, TrustAll};
use mirage_crypto::device::DeviceIdentity;
use mirage_protocol::messages::HostInfo;
use session::HostState;

#[derive(Parser)]
#[command(name = "mirage-host", about = "Mirage screen streaming host")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Control channel TCP port, overrides config
    #[arg(long)]
    control_port: Option<u16>,

    /// Media UDP port, overrides config
    #[arg(long)]
    data_port: Option<u16>,

    /// Encoder bitrate in bps, overrides config
    #[arg(long)]
    bitrate: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirage_host=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        HostConfig::default()
    };

    // CLI overrides
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.data_port {
        config.data_port = port;
    }
    if let Some(bitrate) = args.bitrate {
        config.bitrate_bps = bitrate;
    }

    let state_dir = config
        .state_dir
        .clone()
        .unwrap_or_else(DeviceIdentity::default_dir);
    let identity = DeviceIdentity::load_or_create(&state_dir)
        .with_context(|| format!("failed to load device identity from {}", state_dir.display()))?;

    info!("Mirage host starting");
    info!(
        host = %config.host,
        control_port = config.control_port,
        data_port = config.data_port,
        bitrate_bps = config.bitrate_bps,
        device_id = %identity.device_id,
    );

    let tcp_listener = TcpListener::bind(format!("{}:{}", config.host, config.control_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind control port on {}:{}",
                config.host, config.control_port
            )
        })?;
    info!("control listener bound on {}:{}", config.host, config.control_port);

    // Bind the media socket with large buffers to absorb fragment bursts.
    let udp_socket = {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;
        let _ = sock.set_recv_buffer_size(2 * 1024 * 1024);
        let _ = sock.set_send_buffer_size(2 * 1024 * 1024);
        let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.data_port)
            .parse()
            .with_context(|| format!("invalid UDP address {}:{}", config.host, config.data_port))?;
        sock.bind(&addr.into())
            .with_context(|| format!("failed to bind UDP on {}:{}", config.host, config.data_port))?;
        sock.set_nonblocking(true)
            .context("failed to set non-blocking")?;
        let std_sock: std::net::UdpSocket = sock.into();
        Arc::new(UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?)
    };
    info!("media socket bound on {}:{}", config.host, config.data_port);

    let host_info = HostInfo {
        device_id: *identity.device_id.as_bytes(),
        name: config.name.clone(),
        platform: std::env::consts::OS.to_string(),
    };
    let validator = Arc::new(AsyncMutex::new(HelloValidator::new(
        identity.key_pair,
        host_info,
        config.data_port,
        config.require_encrypted_media_on_local_network,
        config.allow_update_trigger,
    )));

    let state = Arc::new(HostState::new(config, udp_socket.clone()));

    // Registration receive loop on the media socket.
    {
        let state = state.clone();
        let socket = udp_socket;
        tokio::spawn(async move {
            session::run_udp_loop(socket, state).await;
        });
    }

    let trust = Arc::new(TrustAll);
    let input = Arc::new(LogInputSink);

    info!("host ready, accepting connections");
    loop {
        let (tcp_stream, peer_addr) = match tcp_listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "accept error");
                continue;
            }
        };
        let _ = tcp_stream.set_nodelay(true);

        let state = state.clone();
        let validator = validator.clone();
        let trust = trust.clone();
        let input = input.clone();
        tokio::spawn(async move {
            info!(peer = %peer_addr, "connection accepted");
            handle_connection(tcp_stream, state, validator, trust, input).await;
        });
    }
}
