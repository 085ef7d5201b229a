//! Reverse name resolution for peer addresses.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use crate::net::PeerAddr;

/// Maps a numeric address to a host name.
pub trait Resolver: Send + Sync + fmt::Debug {
    fn reverse(&self, ip: IpAddr) -> io::Result<String>;
}

/// The platform resolver (`getnameinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> io::Result<String> {
        dns_lookup::lookup_addr(&ip)
    }
}

/// Host name of one peer, resolved on first request and cached.
#[derive(Debug)]
pub(crate) struct HostName {
    numeric: String,
    ip: Option<IpAddr>,
    resolver: Option<Arc<dyn Resolver>>,
    resolved: OnceLock<String>,
}

impl HostName {
    /// `resolver` is `None` unless the server was created with `resolve_name`.
    pub(crate) fn new(peer: &PeerAddr, resolver: Option<Arc<dyn Resolver>>) -> Self {
        Self {
            numeric: peer.numeric(),
            ip: peer.ip(),
            resolver,
            resolved: OnceLock::new(),
        }
    }

    pub(crate) fn numeric(&self) -> &str {
        &self.numeric
    }

    /// Blocks the caller for the reverse lookup the first time.
    pub(crate) fn host(&self) -> &str {
        let (Some(resolver), Some(ip)) = (&self.resolver, self.ip) else {
            return &self.numeric;
        };
        self.resolved.get_or_init(|| match resolver.reverse(ip) {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(address = %ip, error = %e, "Reverse lookup failed");
                self.numeric.clone()
            }
        })
    }
}
