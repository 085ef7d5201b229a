//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! net (accept, read, close) and server (create, shutdown) produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → Log output chosen by the binary's subscriber
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - The library only emits; subscribers and exporters are installed by
//!   the binaries
//! - Metrics are cheap (atomic increments) and no-ops without a recorder

pub mod logging;
pub mod metrics;
