//! listenkit server runner.
//!
//! Loads a TOML config, obtains a socket broker and starts every configured
//! server with a handler that logs (and optionally echoes) received bytes.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use listenkit::broker::{BrokerClient, BrokerServer, InProcessBroker, SocketBroker};
use listenkit::config::load_config;
use listenkit::lifecycle::wait_for_signal;
use listenkit::observability::{logging::init_logging, metrics::init_metrics};
use listenkit::{DataHandler, ServerHelper};

#[derive(Parser, Debug)]
#[command(name = "listenkit")]
#[command(about = "Run TCP, UDP, TLS and Unix servers from a config file", long_about = None)]
struct Cli {
    /// Path to the TOML config.
    #[arg(short, long, env = "LISTENKIT_CONFIG")]
    config: PathBuf,

    /// Write received bytes back to the peer.
    #[arg(long)]
    echo: bool,

    /// Socket broker rendezvous path. A broker is started there unless one
    /// is already answering.
    #[arg(long, env = "LISTENKIT_BROKER_PATH")]
    broker_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    init_logging(&config.observability.log_level);
    tracing::info!("listenkit v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let broker_path = cli.broker_path.or_else(|| config.broker_path.clone());
    let mut broker_server: Option<BrokerServer> = None;
    let broker: Arc<dyn SocketBroker> = match broker_path {
        Some(path) if UnixStream::connect(&path).is_ok() => {
            tracing::info!(path = %path.display(), "Using running socket broker");
            Arc::new(BrokerClient::new(&path))
        }
        Some(path) => {
            // Nobody answered, so whatever is left at the path is stale.
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let server = BrokerServer::open(&path)?;
            let broker: Arc<dyn SocketBroker> = server.broker();
            broker_server = Some(server);
            broker
        }
        None => Arc::new(InProcessBroker::new()),
    };

    let helper = ServerHelper::builder(broker)
        .drain_timeout(Duration::from_secs(config.drain_timeout_secs))
        .build()?;

    for server in &config.servers {
        let echo = cli.echo;
        let title = server.title.clone().unwrap_or_default();
        let info = helper.create_server_from_config(
            server,
            DataHandler::with_peer(move |data, peer| {
                tracing::info!(
                    title = %title,
                    peer = %peer.remote_address(),
                    bytes = data.len(),
                    "Received data"
                );
                if echo {
                    if let Err(e) = peer.write(data) {
                        tracing::warn!(title = %title, error = %e, "Echo failed");
                    }
                }
            }),
        )?;
        tracing::info!(
            title = %info.title,
            protocol = %info.protocol,
            local_addr = ?info.local_addr,
            "Server started"
        );
    }

    wait_for_signal().await?;
    helper.shutdown().await?;
    drop(broker_server);
    tracing::info!("listenkit stopped");
    Ok(())
}
