//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     close_server / shutdown → stop accept loop → close connections → drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls ServerHelper::shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, close, drain
//! - Draining has a timeout; connections still open after it are
//!   logged and left to finish

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
