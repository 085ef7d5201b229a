//! Per-protocol server options.
//!
//! Each protocol gets its own struct carrying only the fields that make sense
//! for it, so a datagram option can never reach a stream server. Untyped
//! configuration is mapped onto these by `config::validation`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ValidationError;
use crate::net::Protocol;

/// Bind address used when none is given.
pub const DEFAULT_BIND: &str = "0.0.0.0";

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

/// TCP server options.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpOptions {
    /// IPv4 or IPv6 literal to bind.
    pub bind: String,
    /// Obtain the listening socket through the socket broker.
    pub shared: bool,
    /// Report peer host names instead of numeric addresses.
    pub resolve_name: bool,
    /// Listen queue depth.
    pub backlog: Option<u32>,
    /// Upper bound on the final flush of a closing connection.
    pub linger_timeout: Option<Duration>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            shared: true,
            resolve_name: false,
            backlog: None,
            linger_timeout: None,
        }
    }
}

/// Socket-level datagram flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatagramFlags {
    /// `SO_BROADCAST`.
    pub broadcast: bool,
}

/// Largest UDP payload a socket can deliver.
pub const MAX_DATAGRAM_BYTES: usize = 65_535;

/// UDP server options.
#[derive(Debug, Clone, PartialEq)]
pub struct UdpOptions {
    pub bind: String,
    pub shared: bool,
    pub resolve_name: bool,
    /// Largest payload delivered per packet; longer datagrams are truncated.
    pub max_bytes: usize,
    pub flags: DatagramFlags,
}

impl UdpOptions {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bind: default_bind(),
            shared: true,
            resolve_name: false,
            max_bytes,
            flags: DatagramFlags::default(),
        }
    }
}

/// Certificate material for TLS servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertOptions {
    /// PEM certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub private_key_path: PathBuf,
}

/// TLS server options.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsOptions {
    pub bind: String,
    pub shared: bool,
    pub resolve_name: bool,
    pub backlog: Option<u32>,
    pub linger_timeout: Option<Duration>,
    pub certopts: CertOptions,
}

impl TlsOptions {
    pub fn new(certopts: CertOptions) -> Self {
        Self {
            bind: default_bind(),
            shared: true,
            resolve_name: false,
            backlog: None,
            linger_timeout: None,
            certopts,
        }
    }
}

/// Unix-domain stream server options. Addressed by path, not host and port.
#[derive(Debug, Clone, PartialEq)]
pub struct UnixOptions {
    pub path: PathBuf,
    pub shared: bool,
    pub backlog: Option<u32>,
    pub linger_timeout: Option<Duration>,
}

impl UnixOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shared: true,
            backlog: None,
            linger_timeout: None,
        }
    }
}

/// Options for any protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOptions {
    Tcp(TcpOptions),
    Udp(UdpOptions),
    Tls(TlsOptions),
    Unix(UnixOptions),
}

impl ServerOptions {
    pub fn protocol(&self) -> Protocol {
        match self {
            ServerOptions::Tcp(_) => Protocol::Tcp,
            ServerOptions::Udp(_) => Protocol::Udp,
            ServerOptions::Tls(_) => Protocol::Tls,
            ServerOptions::Unix(_) => Protocol::Unix,
        }
    }

    /// Bind address, or the socket path for unix servers.
    pub fn bind(&self) -> String {
        match self {
            ServerOptions::Tcp(o) => o.bind.clone(),
            ServerOptions::Udp(o) => o.bind.clone(),
            ServerOptions::Tls(o) => o.bind.clone(),
            ServerOptions::Unix(o) => o.path.display().to_string(),
        }
    }

    pub fn shared(&self) -> bool {
        match self {
            ServerOptions::Tcp(o) => o.shared,
            ServerOptions::Udp(o) => o.shared,
            ServerOptions::Tls(o) => o.shared,
            ServerOptions::Unix(o) => o.shared,
        }
    }

    pub fn resolve_name(&self) -> bool {
        match self {
            ServerOptions::Tcp(o) => o.resolve_name,
            ServerOptions::Udp(o) => o.resolve_name,
            ServerOptions::Tls(o) => o.resolve_name,
            ServerOptions::Unix(_) => false,
        }
    }

    pub fn backlog(&self) -> Option<u32> {
        match self {
            ServerOptions::Tcp(o) => o.backlog,
            ServerOptions::Tls(o) => o.backlog,
            ServerOptions::Unix(o) => o.backlog,
            ServerOptions::Udp(_) => None,
        }
    }

    pub fn linger_timeout(&self) -> Option<Duration> {
        match self {
            ServerOptions::Tcp(o) => o.linger_timeout,
            ServerOptions::Tls(o) => o.linger_timeout,
            ServerOptions::Unix(o) => o.linger_timeout,
            ServerOptions::Udp(_) => None,
        }
    }

    /// Checks that cannot be expressed in the types: address syntax and
    /// value ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ServerOptions::Unix(o) => {
                if o.path.as_os_str().is_empty() {
                    return Err(ValidationError::MissingSocketPath);
                }
            }
            other => {
                let bind = other.bind();
                if bind.parse::<IpAddr>().is_err() {
                    return Err(ValidationError::InvalidBind(bind));
                }
            }
        }
        if let ServerOptions::Udp(o) = self {
            if o.max_bytes == 0 {
                return Err(ValidationError::InvalidMaxBytes);
            }
            if o.max_bytes > MAX_DATAGRAM_BYTES {
                return Err(ValidationError::MaxBytesTooLarge(o.max_bytes));
            }
        }
        Ok(())
    }
}

impl From<TcpOptions> for ServerOptions {
    fn from(options: TcpOptions) -> Self {
        ServerOptions::Tcp(options)
    }
}

impl From<UdpOptions> for ServerOptions {
    fn from(options: UdpOptions) -> Self {
        ServerOptions::Udp(options)
    }
}

impl From<TlsOptions> for ServerOptions {
    fn from(options: TlsOptions) -> Self {
        ServerOptions::Tls(options)
    }
}

impl From<UnixOptions> for ServerOptions {
    fn from(options: UnixOptions) -> Self {
        ServerOptions::Unix(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_defaults() {
        let options = ServerOptions::from(TcpOptions::default());
        assert_eq!(options.bind(), "0.0.0.0");
        assert!(options.shared());
        assert!(!options.resolve_name());
        assert_eq!(options.protocol(), Protocol::Tcp);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn udp_requires_positive_max_bytes() {
        let options = ServerOptions::from(UdpOptions::new(0));
        assert!(matches!(options.validate(), Err(ValidationError::InvalidMaxBytes)));
        assert!(ServerOptions::from(UdpOptions::new(512)).validate().is_ok());
    }

    #[test]
    fn udp_max_bytes_fits_a_datagram() {
        assert!(ServerOptions::from(UdpOptions::new(MAX_DATAGRAM_BYTES)).validate().is_ok());
        for max_bytes in [MAX_DATAGRAM_BYTES + 1, usize::MAX] {
            let err = ServerOptions::from(UdpOptions::new(max_bytes)).validate().unwrap_err();
            assert!(matches!(err, ValidationError::MaxBytesTooLarge(n) if n == max_bytes));
            assert!(err.to_string().starts_with("BUG: max_bytes must be at most 65535"));
        }
    }

    #[test]
    fn bind_must_be_an_ip_literal() {
        let options = ServerOptions::from(TcpOptions {
            bind: "localhost".into(),
            ..Default::default()
        });
        assert!(matches!(options.validate(), Err(ValidationError::InvalidBind(_))));

        let v6 = ServerOptions::from(TcpOptions {
            bind: "::1".into(),
            ..Default::default()
        });
        assert!(v6.validate().is_ok());
    }

    #[test]
    fn unix_bind_is_the_path() {
        let options = ServerOptions::from(UnixOptions::new("/tmp/listenkit.sock"));
        assert_eq!(options.bind(), "/tmp/listenkit.sock");
        assert!(!options.resolve_name());
        assert!(matches!(
            ServerOptions::from(UnixOptions::new("")).validate(),
            Err(ValidationError::MissingSocketPath)
        ));
    }
}
