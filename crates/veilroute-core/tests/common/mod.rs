//! Shared fixtures: in-process relays and a router pointed at them

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use veilroute_core::{ExitPolicy, OnionRelay, OnionRouter, RelayConfig, RouterConfig};

/// Start `count` echoing relays on loopback
pub async fn spawn_relays(count: usize) -> Vec<OnionRelay> {
    let mut relays = Vec::with_capacity(count);
    for _ in 0..count {
        let relay = OnionRelay::new(RelayConfig {
            exit_policy: ExitPolicy::Echo,
            ..RelayConfig::local()
        });
        relay.start().await.expect("relay failed to start");
        relays.push(relay);
    }
    relays
}

/// `host:port` entry for a relay, which is also its node id
pub fn relay_id(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port())
}

pub fn relay_ids(relays: &[OnionRelay]) -> Vec<String> {
    relays
        .iter()
        .map(|r| relay_id(r.local_addr().expect("relay not running")))
        .collect()
}

/// Router on loopback trusting `trusted`
pub fn router_config(trusted: Vec<String>) -> RouterConfig {
    RouterConfig {
        listen_address: "127.0.0.1".into(),
        listen_port: 0,
        trusted_relays: trusted,
        extend_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub async fn start_router(config: RouterConfig) -> Arc<OnionRouter> {
    let router = Arc::new(OnionRouter::new(config).expect("invalid router config"));
    router.start().await.expect("router failed to start");
    router
}

/// A loopback port with nothing listening on it
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Poll `condition` for up to five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

pub async fn stop_all(router: &OnionRouter, relays: &[OnionRelay]) {
    router.stop().await;
    for relay in relays {
        relay.stop().await;
    }
}
