//! UDP server behavior through the public helper API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;

use listenkit::broker::InProcessBroker;
use listenkit::config::ServerConfig;
use listenkit::{Callback, DataHandler, Protocol, ServerError, ValidationError};

mod common;
use common::{loopback_udp, recorder, snapshot, wait_until, within};

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn udp_config(title: &str) -> ServerConfig {
    ServerConfig {
        title: Some(title.into()),
        port: Some(toml::Value::Integer(0)),
        protocol: Some("udp".into()),
        bind: Some("127.0.0.1".into()),
        max_bytes: Some(128),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_echo_to_sender() {
    let helper = common::helper();
    let info = helper
        .create_udp(
            "myserver",
            0,
            loopback_udp(128),
            DataHandler::with_peer(|data, peer| {
                peer.write(data).unwrap();
            }),
        )
        .unwrap();
    assert_eq!(info.protocol, Protocol::Udp);
    let addr = info.local_addr.unwrap();

    let socket = client().await;
    socket.send_to(b"ping", addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = within(socket.recv_from(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, addr);

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_datagrams_truncated_to_max_bytes() {
    let helper = common::helper();
    let received = recorder::<Vec<u8>>();

    let sink = received.clone();
    let info = helper
        .create_udp(
            "myserver",
            0,
            loopback_udp(4),
            DataHandler::data(move |data| sink.lock().unwrap().push(data.to_vec())),
        )
        .unwrap();

    let socket = client().await;
    socket.send_to(b"abcdefgh", info.local_addr.unwrap()).await.unwrap();
    socket.send_to(b"xy", info.local_addr.unwrap()).await.unwrap();

    assert!(wait_until(|| snapshot(&received).len() == 2).await);
    assert_eq!(snapshot(&received), vec![b"abcd".to_vec(), b"xy".to_vec()]);

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_callbacks_are_refused() {
    let helper = common::helper();
    let errors = recorder::<String>();
    let hosts = recorder::<String>();

    let (errs, log) = (errors.clone(), hosts.clone());
    let info = helper
        .create_udp(
            "myserver",
            0,
            loopback_udp(128),
            DataHandler::with_peer(move |_, peer| {
                let mut errs = errs.lock().unwrap();
                for callback in [Callback::before_close(|_| {}), Callback::close(|_| {})] {
                    if let Err(e) = peer.on(callback) {
                        errs.push(e.to_string());
                    }
                }
                log.lock().unwrap().push(peer.remote_address().to_string());
            }),
        )
        .unwrap();

    let socket = client().await;
    socket.send_to(b"hello", info.local_addr.unwrap()).await.unwrap();

    assert!(wait_until(|| snapshot(&errors).len() == 2).await);
    assert_eq!(
        snapshot(&errors),
        vec![
            "before_close callback is not available for udp".to_string(),
            "close callback is not available for udp".to_string(),
        ]
    );
    assert_eq!(snapshot(&hosts), vec!["127.0.0.1".to_string()]);

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_complete_after_reply() {
    let helper = common::helper();
    let completed = Arc::new(AtomicUsize::new(0));

    let counter = completed.clone();
    let info = helper
        .create_udp(
            "myserver",
            0,
            loopback_udp(128),
            DataHandler::with_peer(move |_, peer| {
                let counter = counter.clone();
                peer.on(Callback::write_complete(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
                peer.write(b"ack").unwrap();
            }),
        )
        .unwrap();

    let socket = client().await;
    socket.send_to(b"data", info.local_addr.unwrap()).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = within(socket.recv_from(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"ack");

    assert!(wait_until(|| completed.load(Ordering::SeqCst) == 1).await);
    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_options_rejected() {
    let helper = common::helper();

    let config = ServerConfig {
        backlog: Some(500),
        ..udp_config("myserver")
    };
    let err = helper
        .create_server_from_config(&config, DataHandler::data(|_| {}))
        .unwrap_err();
    assert_eq!(err.to_string(), "BUG: backlog is available for tcp/tls");

    let config = ServerConfig {
        linger_timeout: Some(1),
        ..udp_config("myserver")
    };
    let err = helper
        .create_server_from_config(&config, DataHandler::data(|_| {}))
        .unwrap_err();
    assert_eq!(err.to_string(), "BUG: linger_timeout is available for tcp/tls");

    let config = ServerConfig {
        max_bytes: None,
        ..udp_config("myserver")
    };
    let err = helper
        .create_server_from_config(&config, DataHandler::data(|_| {}))
        .unwrap_err();
    assert_eq!(err.to_string(), "BUG: max_bytes must be specified for udp");

    assert!(helper.servers().is_empty());
}

#[tokio::test]
async fn test_oversized_max_bytes_rejected() {
    let helper = common::helper();

    let err = helper
        .create_udp("myserver", 0, loopback_udp(usize::MAX), DataHandler::data(|_| {}))
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::Validation(ValidationError::MaxBytesTooLarge(usize::MAX))
    ));

    let config = ServerConfig {
        max_bytes: Some(65_536),
        ..udp_config("myserver")
    };
    let err = helper
        .create_server_from_config(&config, DataHandler::data(|_| {}))
        .unwrap_err();
    assert_eq!(err.to_string(), "BUG: max_bytes must be at most 65535, got 65536");

    assert!(helper.servers().is_empty());
    assert!(helper.create_udp("myserver", 0, loopback_udp(65_535), DataHandler::data(|_| {})).is_ok());
    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_from_config() {
    let helper = common::helper();
    let received = recorder::<u8>();

    let sink = received.clone();
    let info = helper
        .create_server_from_config(
            &udp_config("fromconfig"),
            DataHandler::data(move |data| sink.lock().unwrap().extend_from_slice(data)),
        )
        .unwrap();
    assert_eq!(info.bind, "127.0.0.1");

    let socket = client().await;
    socket.send_to(b"configured", info.local_addr.unwrap()).await.unwrap();
    assert!(wait_until(|| snapshot(&received) == b"configured".to_vec()).await);

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shared_udp_port() {
    let broker = Arc::new(InProcessBroker::new());
    let first = common::helper_with(broker.clone());
    let second = common::helper_with(broker.clone());
    let port = common::unused_udp_port();

    first
        .create_udp("shared", port, loopback_udp(64), DataHandler::data(|_| {}))
        .unwrap();
    second
        .create_udp("shared", port, loopback_udp(64), DataHandler::data(|_| {}))
        .unwrap();
    assert_eq!(broker.len(), 1);

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exclusive_udp_port_conflict() {
    let helper = common::helper();
    let port = common::unused_udp_port();
    let exclusive = || listenkit::net::UdpOptions {
        shared: false,
        ..loopback_udp(64)
    };

    helper
        .create_udp("first", port, exclusive(), DataHandler::data(|_| {}))
        .unwrap();
    let err = helper
        .create_udp("second", port, exclusive(), DataHandler::data(|_| {}))
        .unwrap_err();
    assert!(err.is_address_in_use(), "unexpected error: {err}");

    helper.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_receiving() {
    let helper = common::helper();
    let received = Arc::new(AtomicUsize::new(0));

    let counter = received.clone();
    let info = helper
        .create_udp(
            "myserver",
            0,
            loopback_udp(64),
            DataHandler::data(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let addr = info.local_addr.unwrap();

    let socket = client().await;
    socket.send_to(b"one", addr).await.unwrap();
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 1).await);

    helper.shutdown().await.unwrap();
    assert!(info.is_closed());

    // Nothing is bound any more, so a fresh exclusive bind succeeds.
    std::net::UdpSocket::bind(addr).unwrap();
}
