//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (connections, bytes, datagrams, accept errors)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `listenkit_connections_accepted_total` (counter): accepted connections by protocol
//! - `listenkit_connections_active` (gauge): open connections by protocol
//! - `listenkit_bytes_received_total` (counter): stream bytes by protocol
//! - `listenkit_datagrams_received_total` (counter): UDP packets
//! - `listenkit_accept_errors_total` (counter): failed accepts by server title
//! - `listenkit_servers_created_total` (counter): servers by protocol
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Labels for protocol and server title only

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::Protocol;
use crate::server::Title;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_server_created(protocol: Protocol) {
    counter!("listenkit_servers_created_total", "protocol" => protocol.as_str()).increment(1);
}

pub fn record_connection_opened(protocol: Protocol) {
    counter!("listenkit_connections_accepted_total", "protocol" => protocol.as_str()).increment(1);
    gauge!("listenkit_connections_active", "protocol" => protocol.as_str()).increment(1.0);
}

pub fn record_connection_closed(protocol: Protocol) {
    gauge!("listenkit_connections_active", "protocol" => protocol.as_str()).decrement(1.0);
}

pub fn record_bytes_received(protocol: Protocol, bytes: usize) {
    counter!("listenkit_bytes_received_total", "protocol" => protocol.as_str()).increment(bytes as u64);
}

pub fn record_datagram_received(bytes: usize) {
    counter!("listenkit_datagrams_received_total").increment(1);
    counter!("listenkit_bytes_received_total", "protocol" => Protocol::Udp.as_str()).increment(bytes as u64);
}

pub fn record_accept_error(title: &Title) {
    counter!("listenkit_accept_errors_total", "title" => title.to_string()).increment(1);
}
