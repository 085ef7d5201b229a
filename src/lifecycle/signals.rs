//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM or SIGINT in the binaries
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The library never installs signal handlers; only `main` calls this

use tokio::signal::unix::{signal, SignalKind};

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Block until SIGINT or SIGTERM arrives.
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = interrupt.recv() => Signal::Interrupt,
        _ = terminate.recv() => Signal::Terminate,
    };
    tracing::info!(signal = ?received, "Shutdown signal received");
    Ok(received)
}
