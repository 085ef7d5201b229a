//! listenkit: TCP, UDP, TLS and Unix-domain servers for data-collection
//! plugins.
//!
//! # Architecture Overview
//!
//! ```text
//!   plugin ──create_server──▶ ServerHelper ──▶ validation ──▶ SocketAcquirer
//!                                  │                              │
//!                                  │                     shared?  ├─▶ SocketBroker
//!                                  ▼                              │   (in-process or
//!                            ServerRegistry                       │    rendezvous socket)
//!                                  │                              ▼
//!                                  │                  accept / receive loop (tokio)
//!                                  │                              │
//!                                  ▼                              ▼
//!                              shutdown            Connection / DatagramContext
//!                                                        │
//!                                     data, write_complete, before_close, close
//!                                                        ▼
//!                                                  plugin callbacks
//! ```

// Core subsystems
pub mod broker;
pub mod config;
pub mod net;
pub mod server;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use broker::{BrokerClient, BrokerServer, InProcessBroker, SocketBroker};
pub use config::{HelperConfig, ServerConfig, ValidationError};
pub use net::{
    Callback, Connection, ConnectionError, ConnectionEvent, DatagramContext, Peer, Protocol, ServerOptions,
};
pub use server::{DataHandler, ServerError, ServerHelper, ServerInfo, Title};
