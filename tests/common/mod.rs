//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use listenkit::broker::{InProcessBroker, SocketBroker};
use listenkit::net::{Resolver, TcpOptions, UdpOptions};
use listenkit::ServerHelper;

/// A port nothing is listening on right now.
pub fn unused_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

pub fn unused_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// Helper with its own in-process broker, on the current runtime.
pub fn helper() -> ServerHelper {
    helper_with(Arc::new(InProcessBroker::new()))
}

pub fn helper_with(broker: Arc<dyn SocketBroker>) -> ServerHelper {
    ServerHelper::builder(broker)
        .drain_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

pub fn loopback_tcp(shared: bool) -> TcpOptions {
    TcpOptions {
        bind: "127.0.0.1".into(),
        shared,
        ..Default::default()
    }
}

pub fn loopback_udp(max_bytes: usize) -> UdpOptions {
    UdpOptions {
        bind: "127.0.0.1".into(),
        ..UdpOptions::new(max_bytes)
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Fail the test instead of hanging on a lost packet or stuck peer.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Shared log that callbacks append to.
pub type Recorder<T> = Arc<Mutex<Vec<T>>>;

pub fn recorder<T>() -> Recorder<T> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn snapshot<T: Clone>(recorder: &Recorder<T>) -> Vec<T> {
    recorder.lock().unwrap().clone()
}

/// Resolves every address to a fixed name.
#[derive(Debug)]
pub struct StaticResolver(pub &'static str);

impl Resolver for StaticResolver {
    fn reverse(&self, _ip: IpAddr) -> io::Result<String> {
        Ok(self.0.to_string())
    }
}
