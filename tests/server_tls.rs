//! TLS servers with a generated self-signed certificate.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use listenkit::net::{CertOptions, TlsOptions};
use listenkit::{DataHandler, Protocol, ServerError};

mod common;
use common::{recorder, snapshot, wait_until, within};

struct Fixture {
    _dir: tempfile::TempDir,
    certopts: CertOptions,
    cert: CertificateDer<'static>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let private_key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&private_key_path, generated.key_pair.serialize_pem()).unwrap();

    Fixture {
        certopts: CertOptions {
            cert_path,
            private_key_path,
        },
        cert: generated.cert.der().clone(),
        _dir: dir,
    }
}

fn options(certopts: CertOptions) -> TlsOptions {
    TlsOptions {
        bind: "127.0.0.1".into(),
        shared: false,
        ..TlsOptions::new(certopts)
    }
}

fn connector(cert: &CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_echo_over_tls() {
    let fixture = fixture();
    let helper = common::helper();
    let info = helper
        .create_tls(
            "tlsserver",
            0,
            options(fixture.certopts.clone()),
            DataHandler::with_peer(|data, peer| {
                peer.write(data).unwrap();
            }),
        )
        .unwrap();
    assert_eq!(info.protocol, Protocol::Tls);

    let tcp = TcpStream::connect(info.local_addr.unwrap()).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut client = within(connector(&fixture.cert).connect(name, tcp)).await.unwrap();

    client.write_all(b"secret\n").await.unwrap();
    let mut reply = [0u8; 7];
    within(client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(&reply, b"secret\n");

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_the_server() {
    let fixture = fixture();
    let helper = common::helper();
    let received = recorder::<u8>();

    let sink = received.clone();
    let info = helper
        .create_tls(
            "tlsserver",
            0,
            options(fixture.certopts.clone()),
            DataHandler::data(move |data| sink.lock().unwrap().extend_from_slice(data)),
        )
        .unwrap();
    let addr = info.local_addr.unwrap();

    let mut plain = TcpStream::connect(addr).await.unwrap();
    plain.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut rest = Vec::new();
    let _ = within(plain.read_to_end(&mut rest)).await;
    assert_eq!(info.active_connections(), 0);

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut client = within(connector(&fixture.cert).connect(name, tcp)).await.unwrap();
    client.write_all(b"after\n").await.unwrap();
    client.flush().await.unwrap();

    assert!(wait_until(|| snapshot(&received) == b"after\n".to_vec()).await);
    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_certificate_fails_creation() {
    let helper = common::helper();
    let certopts = CertOptions {
        cert_path: PathBuf::from("/nonexistent/cert.pem"),
        private_key_path: PathBuf::from("/nonexistent/key.pem"),
    };

    let err = helper
        .create_tls("tlsserver", 0, options(certopts), DataHandler::data(|_| {}))
        .unwrap_err();
    assert!(matches!(err, ServerError::Tls(_)), "unexpected error: {err}");
    assert!(helper.server("tlsserver").is_none());
}
