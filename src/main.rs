//! ghostwire entry point
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! sudo ./ghostwire
//!
//! # Run with an explicit configuration
//! sudo ./ghostwire -c /etc/ghostwire/config.yaml
//!
//! # Validate a configuration without starting
//! ./ghostwire -c config.yaml --check
//! ```
//!
//! Root (or CAP_NET_RAW plus CAP_NET_ADMIN for the iptables rules) is
//! required: the fabric opens raw capture handles on the configured
//! interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ghostwire::client::{Client, PcapEndpointFactory};
use ghostwire::config::{load_config, Config, Role};
use ghostwire::fabric::{DatagramSocket, PacketEndpoint};
use ghostwire::iptables::IptablesManager;
use ghostwire::server::Server;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Validate configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("config.yaml");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("ghostwire v{}", ghostwire::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"ghostwire v{}

Tunnel proxy carrying KCP/QUIC over crafted TCP segments via libpcap.

USAGE:
    ghostwire [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file [default: config.yaml]
        --check            Validate the configuration and exit
    -h, --help             Print help
    -v, --version          Print version",
        ghostwire::VERSION
    );
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ghostwire={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {:?}", args.config_path))?;

    if args.check_config {
        println!("Configuration OK ({:?})", args.config_path);
        return Ok(());
    }

    init_tracing(&config.log.level);
    info!(version = ghostwire::VERSION, role = config.role.as_str(), "starting");

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    // Ctrl-C / SIGTERM initiate a graceful shutdown.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    // The NOTRACK/RST-drop rules make the raw tuple viable; applied before
    // the fabric opens, reversed after everything stops.
    let mut iptables = if config.gfw_resist.auto_iptables {
        let mut manager = IptablesManager::new(config.raw_port());
        match manager.apply() {
            Ok(()) => Some(manager),
            Err(e) => {
                warn!(error = %e, "could not apply iptables rules, continuing without");
                None
            }
        }
    } else {
        None
    };

    let result = match config.role {
        Role::Server => run_server(&config, &cancel).await,
        Role::Client => run_client(&config, &cancel).await,
    };

    if let Some(manager) = iptables.as_mut() {
        manager.cleanup();
    }

    match result {
        Ok(()) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler cannot fail");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

async fn run_server(config: &Arc<Config>, cancel: &CancellationToken) -> Result<()> {
    let endpoint = PacketEndpoint::open(
        &config.network,
        config.performance.packet_workers,
        cancel,
    )
    .context("opening the packet fabric")?;

    let listener = ghostwire::transport::listen(
        &config.transport,
        endpoint as Arc<dyn DatagramSocket>,
        cancel,
    )
    .await
    .context("starting the transport listener")?;

    // The TUN device seam is provisioned externally; without one, TUN
    // streams are rejected even when the flag is set.
    let server = Server::new(Arc::clone(config), None, cancel.clone());
    server.run(listener).await.context("accept loop failed")?;
    Ok(())
}

async fn run_client(config: &Arc<Config>, cancel: &CancellationToken) -> Result<()> {
    let factory = Arc::new(PcapEndpointFactory::new(config, cancel.clone()));
    let client = Client::start(Arc::clone(config), factory, cancel.clone())
        .await
        .context("establishing transport connections")?;

    info!(
        "client ready; front-ends (SOCKS5, forwarders, TUN) attach via the library API"
    );

    cancel.cancelled().await;
    client.close().await;
    Ok(())
}
