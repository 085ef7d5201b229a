//! Standalone socket broker, so several listenkit processes can listen on
//! the same addresses.

use std::path::PathBuf;

use clap::Parser;

use listenkit::broker::BrokerServer;
use listenkit::lifecycle::wait_for_signal;
use listenkit::observability::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "listenkit-broker")]
#[command(about = "Share listening sockets between processes", long_about = None)]
struct Cli {
    /// Rendezvous socket path.
    #[arg(short, long, env = "LISTENKIT_BROKER_PATH")]
    path: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let server = BrokerServer::open(&cli.path)?;
    wait_for_signal().await?;

    // Joins the broker thread and removes the rendezvous file.
    drop(server);
    Ok(())
}
