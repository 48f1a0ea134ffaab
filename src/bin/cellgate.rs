//! Cellgate daemon
//!
//! Wires one gateway context into:
//! - Local HTTP and SOCKS5 proxies
//! - The relay tunnel client (with its IP forwarder)
//! - The relay command executor

use anyhow::{Context, Result};
use clap::Parser;
use cellgate::{
    command::CommandExecutor,
    config::{generate_example_config, Config, LoggingConfig, MonitorKind, NetworkConfig, TunnelConfig},
    network::{DnsResolver, NetworkMonitor, NetworkSelector, StaticMonitor},
    proxy::{HttpProxyServer, Socks5Server, TrafficSnapshot, TrafficStats},
    tunnel::{TunnelClient, VpnPlatform},
    CredentialStore, GatewayContext, VERSION,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// How often cumulative proxy traffic is logged
const TRAFFIC_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Time allowed for tasks to wind down after ctrl-c
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cellgate - cellular egress gateway
#[derive(Parser, Debug)]
#[command(name = "cellgate")]
#[command(about = "Cellular egress gateway: relay tunnel, IP forwarder and local proxies")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "cellgate.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Relay address host:port (overrides config)
    #[arg(short, long)]
    relay: Option<String>,

    /// Device identifier, UUID (overrides config)
    #[arg(long)]
    device_id: Option<String>,

    /// HTTP proxy port, 0 disables it
    #[arg(long)]
    http_port: Option<u16>,

    /// SOCKS5 proxy port, 0 disables it
    #[arg(long)]
    socks5_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        print!("{}", generate_example_config());
        return Ok(());
    }

    let config_found = Path::new(&args.config).exists();
    let mut config = if config_found {
        Config::load(&args.config)
            .with_context(|| format!("Failed to load config from {}", args.config))?
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &args);

    init_logging(&config.logging)?;
    info!("Cellgate v{} starting", VERSION);
    if !config_found {
        warn!("Config file {} not found, using defaults", args.config);
    }

    let selector = Arc::new(NetworkSelector::new(
        build_monitor(&config.network)?,
        DnsResolver::new(
            config.network.dns_servers.clone(),
            config.network.dns_timeout(),
        ),
    ));
    selector.acquire().context("Failed to request networks")?;

    let ctx = GatewayContext::new(
        selector.clone(),
        build_platform(config.tunnel.as_ref(), &config.network),
    );
    let credentials = Arc::new(CredentialStore::with_entries(
        config
            .proxy
            .credentials
            .iter()
            .map(|c| (c.username.clone(), c.password.clone())),
    ));
    if credentials.is_empty() {
        info!("No proxy credentials configured, accepting any client");
    }

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut traffic = Vec::new();

    if config.proxy.http_port != 0 {
        let addr = SocketAddr::new(config.proxy.listen, config.proxy.http_port);
        let server = HttpProxyServer::bind(addr, ctx.clone(), credentials.clone(), config.proxy.clone())
            .await
            .with_context(|| format!("Failed to start HTTP proxy on {}", addr))?;
        traffic.push(server.stats());
        let token = shutdown.clone();
        tasks.spawn(async move { server.run(token).await });
    }

    if config.proxy.socks5_port != 0 {
        let addr = SocketAddr::new(config.proxy.listen, config.proxy.socks5_port);
        let server = Socks5Server::bind(addr, ctx.clone(), credentials.clone(), config.proxy.clone())
            .await
            .with_context(|| format!("Failed to start SOCKS5 proxy on {}", addr))?;
        traffic.push(server.stats());
        let token = shutdown.clone();
        tasks.spawn(async move { server.run(token).await });
    }

    let tunnel = match config.tunnel.clone() {
        Some(mut tunnel_config) => {
            if tunnel_config.device_id.trim().is_empty() {
                tunnel_config.device_id = uuid::Uuid::new_v4().to_string();
                warn!(
                    "No device_id configured, using {} for this run; set it in the config to keep it",
                    tunnel_config.device_id
                );
            }

            let (commands_tx, commands_rx) = mpsc::channel(16);
            let client = TunnelClient::new(tunnel_config, config.forwarder.clone(), ctx.clone())
                .context("Invalid tunnel configuration")?
                .with_commands(commands_tx);
            let client = Arc::new(client);
            info!("Tunnel device id {}", client.device_id());

            tasks.spawn(CommandExecutor::new(ctx.clone()).run(commands_rx, shutdown.clone()));
            let runner = client.clone();
            tasks.spawn(async move { runner.run().await });
            Some(client)
        }
        None => {
            info!("No [tunnel] section, running local proxies only");
            None
        }
    };

    tasks.spawn(report_traffic(traffic, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    shutdown.cancel();
    if let Some(tunnel) = &tunnel {
        tunnel.disconnect();
    }
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after {:?}, aborting", SHUTDOWN_GRACE);
        tasks.abort_all();
    }
    selector.release();

    info!("Cellgate stopped");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(relay) = &args.relay {
        config
            .tunnel
            .get_or_insert_with(TunnelConfig::default)
            .relay = relay.clone();
    }
    if let Some(device_id) = &args.device_id {
        config
            .tunnel
            .get_or_insert_with(TunnelConfig::default)
            .device_id = device_id.clone();
    }
    if let Some(port) = args.http_port {
        config.proxy.http_port = port;
    }
    if let Some(port) = args.socks5_port {
        config.proxy.socks5_port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level {:?}", logging.level))?;

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(logging.file.is_none());

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
    Ok(())
}

fn build_monitor(network: &NetworkConfig) -> Result<Arc<dyn NetworkMonitor>> {
    let cellular = network.cellular_interface.clone();
    let wifi = network.wifi_interface.clone();

    match network.monitor {
        MonitorKind::Static => Ok(Arc::new(StaticMonitor::new(cellular, wifi))),
        #[cfg(target_os = "linux")]
        MonitorKind::Sysfs => Ok(Arc::new(cellgate::network::SysfsMonitor::new(
            cellular,
            wifi,
            network.poll_interval(),
        ))),
        #[cfg(not(target_os = "linux"))]
        MonitorKind::Sysfs => Err(anyhow::anyhow!("The sysfs network monitor requires Linux")),
    }
}

/// Protected sockets fall back to the cellular interface when no underlay is configured
#[cfg(target_os = "linux")]
fn build_platform(tunnel: Option<&TunnelConfig>, network: &NetworkConfig) -> Arc<dyn VpnPlatform> {
    let defaults = TunnelConfig::default();
    let tunnel_config = tunnel.unwrap_or(&defaults);
    let protect_interface = tunnel_config
        .protect_interface
        .clone()
        .or_else(|| network.cellular_interface.clone());
    if tunnel.is_some() && protect_interface.is_none() && tunnel_config.fwmark.is_none() {
        warn!("Neither tunnel.protect_interface, tunnel.fwmark nor network.cellular_interface is set; the tunnel cannot protect its relay socket");
    }
    Arc::new(
        cellgate::tunnel::LinuxTunPlatform::new(tunnel_config.interface_name.clone())
            .with_protect_interface(protect_interface)
            .with_fwmark(tunnel_config.fwmark),
    )
}

#[cfg(not(target_os = "linux"))]
fn build_platform(tunnel: Option<&TunnelConfig>, _network: &NetworkConfig) -> Arc<dyn VpnPlatform> {
    if tunnel.is_some() {
        warn!("No TUN support on this platform; the tunnel cannot bring up its interface");
    }
    let (platform, _ports) = cellgate::tunnel::ChannelPlatform::new(1);
    Arc::new(platform)
}

async fn report_traffic(servers: Vec<Arc<TrafficStats>>, shutdown: CancellationToken) {
    if servers.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(TRAFFIC_REPORT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let total = servers
                    .iter()
                    .map(|s| s.snapshot())
                    .fold(TrafficSnapshot::default(), TrafficSnapshot::combined);
                info!("Proxy traffic: {} bytes in, {} bytes out", total.bytes_in, total.bytes_out);
            }
        }
    }
}
