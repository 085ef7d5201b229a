//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! accept() fails (EMFILE, ENOBUFS, ...)
//!     → backoff.rs (exponential delay with jitter)
//!     → accept loop sleeps, then retries
//! ```
//!
//! # Design Decisions
//! - Accept errors never stop a server
//! - Binds and writes are not retried; those errors reach the caller

pub mod backoff;
