//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (title/port/protocol checks, option matrix)
//!     → ServerSpec (typed ServerOptions per protocol)
//!     → ServerHelper::create_server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Server entries stay untyped until validation so bad values get
//!   `BUG:` diagnostics rather than serde errors

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{CertConfig, HelperConfig, ObservabilityConfig, ServerConfig};
pub use validation::{
    validate_config, validate_connection_server, validate_server, ServerSpec, ValidationError,
};
