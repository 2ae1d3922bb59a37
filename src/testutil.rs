//! Fixtures shared by unit tests.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::config::{Config, StoreBackend};
use crate::types::{Endpoint, Network, NETWORK_TYPE_OVERLAY};

pub(crate) const HOSTNAME: &str = "host-a";
pub(crate) const HOST_IP: &str = "192.168.1.10";
pub(crate) const REMOTE_HOST_IP: &str = "192.168.1.20";
pub(crate) const TARGET_NS: &str = "/proc/1234/ns/net";

pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.hostname = Some(HOSTNAME.into());
    config.host_ip = HOST_IP.parse().unwrap();
    config.store.backend = StoreBackend::Memory;
    config.lock_wait_secs = 1;
    config
}

pub(crate) fn sample_network() -> Network {
    Network {
        id: "n1".into(),
        name: "n1".into(),
        kind: NETWORK_TYPE_OVERLAY.into(),
        netns: PathBuf::from("/var/run/vxmesh/netns/vx-test"),
        vni: 42,
        ip_range: "10.0.0.0/24".parse().unwrap(),
        gateway: "10.0.0.1/24".parse().unwrap(),
        created_at: Utc::now(),
    }
}

/// An active endpoint owned by another host of `sample_network`.
pub(crate) fn remote_endpoint(id: &str, address: &str) -> Endpoint {
    let target_ip: ipnet::IpNet = address.parse().unwrap();
    let octets = match target_ip.addr() {
        std::net::IpAddr::V4(v4) => v4.octets(),
        std::net::IpAddr::V6(_) => panic!("fixture expects IPv4"),
    };
    Endpoint {
        id: id.into(),
        network_id: "n1".into(),
        hostname: "host-b".into(),
        host_ip: Some(REMOTE_HOST_IP.parse().unwrap()),
        created_at: Some(Utc::now()),
        netns: "/proc/99/ns/net".into(),
        overlay_iface: "ve-0badf00d".into(),
        overlay_mac: "02:00:00:00:00:99".into(),
        target_iface: "eth0".into(),
        target_mac: format!(
            "02:84:{:02x}:{:02x}:{:02x}:{:02x}",
            octets[0], octets[1], octets[2], octets[3]
        ),
        target_ip: Some(target_ip),
        active: true,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
