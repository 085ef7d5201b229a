//! Server configuration validation.
//!
//! # Responsibilities
//! - Check title, port and protocol of untyped server entries
//! - Reject options that belong to another protocol
//! - Map validated entries onto typed [`ServerOptions`]
//! - Detect duplicate titles across a whole config
//!
//! # Design Decisions
//! - Every failure here is a caller bug; messages carry a `BUG:` prefix
//! - Validation is pure and runs before any socket is created
//! - `validate_config` returns all errors, not just the first

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{HelperConfig, ServerConfig};
use crate::net::options::{
    CertOptions, DatagramFlags, ServerOptions, TcpOptions, TlsOptions, UdpOptions, UnixOptions,
    DEFAULT_BIND,
};
use crate::net::Protocol;
use crate::server::Title;

/// A server definition rejected before any I/O took place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("BUG: title must be a symbol")]
    InvalidTitle,

    #[error("BUG: port must be an integer")]
    InvalidPort,

    #[error("BUG: invalid protocol name")]
    InvalidProtocol,

    /// Stream-only option given to a datagram server.
    #[error("BUG: {0} is available for tcp/tls")]
    StreamOnly(&'static str),

    /// Datagram-only option given to a stream server.
    #[error("BUG: {0} is available for udp")]
    DatagramOnly(&'static str),

    #[error("BUG: certopts is available only for tls")]
    TlsOnly,

    #[error("BUG: max_bytes must be specified for udp")]
    MissingMaxBytes,

    #[error("BUG: max_bytes must be greater than zero")]
    InvalidMaxBytes,

    #[error("BUG: max_bytes must be at most 65535, got {0}")]
    MaxBytesTooLarge(usize),

    #[error("BUG: certopts must be specified for tls")]
    MissingCertopts,

    #[error("BUG: bind must be a socket path for unix")]
    MissingSocketPath,

    #[error("BUG: bind address must be an ip address literal, got {0:?}")]
    InvalidBind(String),

    #[error("BUG: unknown datagram flag {0:?}")]
    UnknownFlag(String),

    #[error("BUG: cannot create connection for UDP")]
    ConnectionForDatagram,

    #[error("BUG: server title {0} is already registered")]
    DuplicateTitle(String),
}

/// A validated server entry, ready for `ServerHelper::create_server`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub title: Title,
    pub port: u16,
    pub options: ServerOptions,
}

/// Title must be present and symbolic.
pub fn validate_title(value: Option<&str>) -> Result<Title, ValidationError> {
    match value {
        Some(title) => Title::new(title),
        None => Err(ValidationError::InvalidTitle),
    }
}

/// Port must be an integer in `0..=65535`. Strings and floats are rejected.
pub fn validate_port(value: Option<&toml::Value>) -> Result<u16, ValidationError> {
    match value {
        Some(toml::Value::Integer(port)) => {
            u16::try_from(*port).map_err(|_| ValidationError::InvalidPort)
        }
        _ => Err(ValidationError::InvalidPort),
    }
}

/// Protocol defaults to tcp when omitted.
pub fn validate_protocol(value: Option<&str>) -> Result<Protocol, ValidationError> {
    match value {
        Some(name) => name.parse(),
        None => Ok(Protocol::Tcp),
    }
}

/// Validate an entry for a server with a data handler.
pub fn validate_server(config: &ServerConfig) -> Result<ServerSpec, ValidationError> {
    let title = validate_title(config.title.as_deref())?;
    let port = validate_port(config.port.as_ref())?;
    let protocol = validate_protocol(config.protocol.as_deref())?;

    check_option_leakage(config, protocol)?;
    let options = build_options(config, protocol)?;
    options.validate()?;

    Ok(ServerSpec {
        title,
        port,
        options,
    })
}

/// Validate an entry for a connection-only server. UDP has no connections.
pub fn validate_connection_server(config: &ServerConfig) -> Result<ServerSpec, ValidationError> {
    validate_title(config.title.as_deref())?;
    validate_port(config.port.as_ref())?;
    if validate_protocol(config.protocol.as_deref())? == Protocol::Udp {
        return Err(ValidationError::ConnectionForDatagram);
    }
    validate_server(config)
}

/// Validate every server entry of a config, collecting all failures.
pub fn validate_config(config: &HelperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut titles = HashSet::new();

    for server in &config.servers {
        match validate_server(server) {
            Ok(spec) => {
                if !titles.insert(spec.title.clone()) {
                    errors.push(ValidationError::DuplicateTitle(spec.title.to_string()));
                }
            }
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_option_leakage(config: &ServerConfig, protocol: Protocol) -> Result<(), ValidationError> {
    if protocol.is_stream() {
        if config.max_bytes.is_some() {
            return Err(ValidationError::DatagramOnly("max_bytes"));
        }
        if config.flags.is_some() {
            return Err(ValidationError::DatagramOnly("flags"));
        }
    } else {
        if config.linger_timeout.is_some() {
            return Err(ValidationError::StreamOnly("linger_timeout"));
        }
        if config.backlog.is_some() {
            return Err(ValidationError::StreamOnly("backlog"));
        }
    }
    if protocol != Protocol::Tls && config.certopts.is_some() {
        return Err(ValidationError::TlsOnly);
    }
    Ok(())
}

fn build_options(config: &ServerConfig, protocol: Protocol) -> Result<ServerOptions, ValidationError> {
    let bind = config.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string());
    let shared = config.shared.unwrap_or(true);
    let resolve_name = config.resolve_name.unwrap_or(false);
    let linger_timeout = config.linger_timeout.map(Duration::from_secs);

    let options = match protocol {
        Protocol::Tcp => ServerOptions::Tcp(TcpOptions {
            bind,
            shared,
            resolve_name,
            backlog: config.backlog,
            linger_timeout,
        }),
        Protocol::Udp => {
            let max_bytes = config.max_bytes.ok_or(ValidationError::MissingMaxBytes)?;
            let flags = parse_flags(config.flags.as_deref().unwrap_or_default())?;
            ServerOptions::Udp(UdpOptions {
                bind,
                shared,
                resolve_name,
                max_bytes,
                flags,
            })
        }
        Protocol::Tls => {
            let certopts = config.certopts.as_ref().ok_or(ValidationError::MissingCertopts)?;
            ServerOptions::Tls(TlsOptions {
                bind,
                shared,
                resolve_name,
                backlog: config.backlog,
                linger_timeout,
                certopts: CertOptions {
                    cert_path: certopts.cert_path.clone(),
                    private_key_path: certopts.private_key_path.clone(),
                },
            })
        }
        Protocol::Unix => {
            let path = config.bind.clone().ok_or(ValidationError::MissingSocketPath)?;
            ServerOptions::Unix(UnixOptions {
                path: path.into(),
                shared,
                backlog: config.backlog,
                linger_timeout,
            })
        }
    };
    Ok(options)
}

fn parse_flags(flags: &[String]) -> Result<DatagramFlags, ValidationError> {
    let mut parsed = DatagramFlags::default();
    for flag in flags {
        match flag.as_str() {
            "broadcast" => parsed.broadcast = true,
            other => return Err(ValidationError::UnknownFlag(other.to_string())),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::CertConfig;

    fn tcp(title: &str) -> ServerConfig {
        ServerConfig {
            title: Some(title.to_string()),
            port: Some(toml::Value::Integer(24224)),
            ..Default::default()
        }
    }

    fn with_protocol(protocol: &str) -> ServerConfig {
        ServerConfig {
            protocol: Some(protocol.to_string()),
            ..tcp("myserver")
        }
    }

    fn certopts() -> CertConfig {
        CertConfig {
            cert_path: "cert.pem".into(),
            private_key_path: "key.pem".into(),
        }
    }

    #[test]
    fn rejects_missing_empty_and_non_symbolic_titles() {
        for title in [None, Some(""), Some("my server"), Some("1st")] {
            let config = ServerConfig {
                title: title.map(str::to_string),
                ..tcp("x")
            };
            let err = validate_server(&config).unwrap_err();
            assert_eq!(err.to_string(), "BUG: title must be a symbol");
        }
        assert!(validate_server(&tcp("myserver")).is_ok());
    }

    #[test]
    fn rejects_ports_that_are_not_integers() {
        let bad = [
            None,
            Some(toml::Value::String("1".into())),
            Some(toml::Value::Float(1.5)),
            Some(toml::Value::Integer(-1)),
            Some(toml::Value::Integer(70_000)),
        ];
        for port in bad {
            let config = ServerConfig { port, ..tcp("myserver") };
            assert_eq!(validate_server(&config).unwrap_err(), ValidationError::InvalidPort);
        }

        let spec = validate_server(&tcp("myserver")).unwrap();
        assert_eq!(spec.port, 24224);
    }

    #[test]
    fn defaults_to_tcp_on_any_address() {
        let spec = validate_server(&tcp("myserver")).unwrap();
        assert_eq!(spec.options.protocol(), Protocol::Tcp);
        assert_eq!(spec.options.bind(), "0.0.0.0");
        assert!(spec.options.shared());
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = validate_server(&with_protocol("quic")).unwrap_err();
        assert_eq!(err.to_string(), "BUG: invalid protocol name");
    }

    #[test]
    fn rejects_udp_options_on_stream_protocols() {
        for proto in ["tcp", "tls", "unix"] {
            let config = ServerConfig {
                max_bytes: Some(128),
                ..with_protocol(proto)
            };
            assert_eq!(
                validate_server(&config).unwrap_err(),
                ValidationError::DatagramOnly("max_bytes")
            );

            let config = ServerConfig {
                flags: Some(vec!["broadcast".into()]),
                ..with_protocol(proto)
            };
            assert_eq!(
                validate_server(&config).unwrap_err(),
                ValidationError::DatagramOnly("flags")
            );
        }
    }

    #[test]
    fn rejects_stream_options_on_udp() {
        let config = ServerConfig {
            linger_timeout: Some(1),
            max_bytes: Some(128),
            ..with_protocol("udp")
        };
        assert_eq!(
            validate_server(&config).unwrap_err().to_string(),
            "BUG: linger_timeout is available for tcp/tls"
        );

        let config = ServerConfig {
            backlog: Some(500),
            ..with_protocol("udp")
        };
        assert_eq!(
            validate_server(&config).unwrap_err().to_string(),
            "BUG: backlog is available for tcp/tls"
        );
    }

    #[test]
    fn rejects_certopts_outside_tls() {
        for (proto, max_bytes) in [("tcp", None), ("udp", Some(128)), ("unix", None)] {
            let config = ServerConfig {
                certopts: Some(certopts()),
                max_bytes,
                ..with_protocol(proto)
            };
            assert_eq!(
                validate_server(&config).unwrap_err().to_string(),
                "BUG: certopts is available only for tls"
            );
        }

        let config = ServerConfig {
            certopts: Some(certopts()),
            ..with_protocol("tls")
        };
        assert!(validate_server(&config).is_ok());
    }

    #[test]
    fn udp_needs_max_bytes_and_known_flags() {
        assert_eq!(
            validate_server(&with_protocol("udp")).unwrap_err(),
            ValidationError::MissingMaxBytes
        );

        let config = ServerConfig {
            max_bytes: Some(512),
            flags: Some(vec!["broadcast".into()]),
            ..with_protocol("udp")
        };
        match validate_server(&config).unwrap().options {
            ServerOptions::Udp(udp) => {
                assert_eq!(udp.max_bytes, 512);
                assert!(udp.flags.broadcast);
            }
            other => panic!("unexpected options {:?}", other),
        }

        let config = ServerConfig {
            max_bytes: Some(512),
            flags: Some(vec!["multicast".into()]),
            ..with_protocol("udp")
        };
        assert!(matches!(
            validate_server(&config).unwrap_err(),
            ValidationError::UnknownFlag(_)
        ));
    }

    #[test]
    fn unix_takes_its_path_from_bind() {
        assert_eq!(
            validate_server(&with_protocol("unix")).unwrap_err(),
            ValidationError::MissingSocketPath
        );

        let config = ServerConfig {
            bind: Some("/tmp/plugin.sock".into()),
            ..with_protocol("unix")
        };
        let spec = validate_server(&config).unwrap();
        assert_eq!(spec.options.bind(), "/tmp/plugin.sock");
    }

    #[test]
    fn connection_servers_reject_udp() {
        let config = ServerConfig {
            max_bytes: Some(128),
            ..with_protocol("udp")
        };
        assert_eq!(
            validate_connection_server(&config).unwrap_err().to_string(),
            "BUG: cannot create connection for UDP"
        );
        assert!(validate_connection_server(&tcp("myserver")).is_ok());
    }

    #[test]
    fn config_validation_collects_every_error() {
        let config = HelperConfig {
            servers: vec![
                tcp("first"),
                tcp("first"),
                with_protocol("quic"),
                ServerConfig { port: None, ..tcp("third") },
            ],
            ..Default::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateTitle("first".into()),
                ValidationError::InvalidProtocol,
                ValidationError::InvalidPort,
            ]
        );
    }
}
