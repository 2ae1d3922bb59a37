//! Records persisted in the distributed store.
//!
//! Every record is serialised as JSON with [`serde`](https://serde.rs/).
//! Endpoints are written twice (per host and per network) and networks
//! once; the field names are part of the on-store format and are shared
//! by every host of the cluster, so renaming one is a migration.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

/// Network type tag. Only the VXLAN overlay exists today.
pub const NETWORK_TYPE_OVERLAY: &str = "overlay";

/// A cross-host layer-2 segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Bind-mounted namespace handle, identical on every host.
    pub netns: PathBuf,
    pub vni: u32,
    pub ip_range: IpNet,
    /// Address carried by the bridge inside the namespace.
    pub gateway: IpNet,
    pub created_at: DateTime<Utc>,
}

/// A workload attachment to a network.
///
/// When `active` is false the veth fields are leftovers of a previous
/// activation and must not be used to program neighbors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub network_id: String,
    pub hostname: String,
    /// Tunnel endpoint other hosts use to reach this endpoint.
    pub host_ip: Option<IpAddr>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub netns: String,
    #[serde(default)]
    pub overlay_iface: String,
    #[serde(default)]
    pub overlay_mac: String,
    #[serde(default)]
    pub target_iface: String,
    #[serde(default)]
    pub target_mac: String,
    pub target_ip: Option<IpNet>,
    #[serde(default)]
    pub active: bool,
}

/// Marks that a host has (or had) the fabric of a network set up, so a
/// restarted node knows what to rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetworkLink {
    pub hostname: String,
    pub network_id: String,
    pub created_at: DateTime<Utc>,
}

/// Docker plugin endpoint id bound to a sandbox id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBinding {
    pub plugin_id: String,
    pub sand_id: String,
}

/// Kind of mutation carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single key mutation delivered by a prefix watch.
///
/// Delete events carry an empty `value`; the previous value lives at
/// `revision - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: i64,
}
