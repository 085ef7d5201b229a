//! Plugin-facing server management.
//!
//! # Data Flow
//! ```text
//! ServerHelper::create_server(title, port, options, handler)
//!     → validate (title, options, duplicate title)
//!     → load TLS material (tls only)
//!     → SocketAcquirer (broker or exclusive bind)
//!     → spawn accept/receive loop on the injected runtime
//!     → ServerRegistry::register
//!     ← ServerInfo
//! ```
//!
//! # Design Decisions
//! - One helper per plugin instance; titles are unique per helper
//! - Creation is synchronous and holds the registry lock, so a failed
//!   creation leaves nothing registered
//! - Shutdown is best effort and in registration order

pub mod helper;
pub mod info;
pub mod registry;
pub mod title;

use std::io;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ValidationError;

pub use helper::{DataHandler, ServerHelper, ServerHelperBuilder};
pub use info::ServerInfo;
pub use registry::ServerRegistry;
pub use title::Title;

/// Errors returned when creating or closing servers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("socket broker failed: {0}")]
    Broker(BrokerError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("server {title} task failed: {reason}")]
    Task { title: String, reason: String },
}

impl From<BrokerError> for ServerError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::AddressInUse(addr) => ServerError::AddressInUse(addr),
            other => ServerError::Broker(other),
        }
    }
}

impl ServerError {
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, ServerError::AddressInUse(_))
    }

    /// True for errors caused by the caller passing bad arguments.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, ServerError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
