//! Kernel link configuration.
//!
//! Every operation names the network namespace it runs in. Namespace
//! switches are per OS thread, so the production backend never switches
//! the agent's own threads: each call is a short-lived `ip`/`bridge`
//! child entered into the namespace with `nsenter`, bounded by a timeout.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::{Error, Result};

pub mod ip;
#[cfg(test)]
pub(crate) mod memory;

pub use ip::IpCommand;

/// Where a link operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Netns {
    /// The namespace of PID 1, entered explicitly even when the agent
    /// runs in another one.
    Host,
    /// A namespace handle file, bind-mounted or under `/proc`.
    Path(PathBuf),
}

impl Netns {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Netns::Path(path.into())
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Netns::Host => write!(f, "host"),
            Netns::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A network interface as seen inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: String,
    /// `bridge`, `vxlan`, `veth`... `None` for plain devices like `lo`.
    pub kind: Option<String>,
    pub master: Option<String>,
    pub up: bool,
    pub mtu: u32,
    /// VXLAN network identifier, for VXLAN devices.
    pub vni: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub vni: u32,
    pub port: u16,
    pub local: Option<IpAddr>,
    /// Flood-and-learn; off when neighbors are pushed by the control plane.
    pub learning: bool,
}

#[async_trait]
pub trait Netlink: Send + Sync {
    /// Create a persistent namespace bound at `path`. No-op if it exists.
    async fn create_netns(&self, path: &Path) -> Result<()>;

    /// Unmount and remove the handle at `path`. No-op if it is gone.
    async fn delete_netns(&self, path: &Path) -> Result<()>;

    async fn netns_exists(&self, path: &Path) -> Result<bool>;

    async fn links(&self, ns: &Netns) -> Result<Vec<Link>>;

    async fn add_bridge(&self, ns: &Netns, name: &str) -> Result<()>;

    async fn add_vxlan(&self, ns: &Netns, name: &str, spec: &VxlanSpec) -> Result<()>;

    async fn add_veth(&self, ns: &Netns, name: &str, peer: &str) -> Result<()>;

    /// Move link `name` from `ns` into `target`.
    async fn set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()>;

    async fn rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()>;

    async fn set_mac(&self, ns: &Netns, name: &str, mac: &str) -> Result<()>;

    async fn set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()>;

    async fn set_master(&self, ns: &Netns, name: &str, master: &str) -> Result<()>;

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<()>;

    /// Delete link `name`. Returns false if it did not exist.
    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<bool>;

    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<IpNet>>;

    async fn add_address(&self, ns: &Netns, name: &str, address: IpNet) -> Result<()>;

    /// Install a permanent ARP/NDP entry `ip -> mac` on `dev`.
    async fn neigh_replace(&self, ns: &Netns, dev: &str, ip: IpAddr, mac: &str) -> Result<()>;

    async fn neigh_delete(&self, ns: &Netns, dev: &str, ip: IpAddr) -> Result<bool>;

    /// Install a permanent `self` FDB entry sending `mac` to tunnel endpoint `dst`.
    async fn fdb_replace(&self, ns: &Netns, dev: &str, mac: &str, dst: IpAddr) -> Result<()>;

    async fn fdb_delete(&self, ns: &Netns, dev: &str, mac: &str, dst: IpAddr) -> Result<bool>;
}

pub fn find_link<'a>(links: &'a [Link], name: &str) -> Option<&'a Link> {
    links.iter().find(|link| link.name == name)
}

pub fn find_link_by_mac<'a>(links: &'a [Link], mac: &str) -> Option<&'a Link> {
    links.iter().find(|link| link.mac.eq_ignore_ascii_case(mac))
}

/// Normalise `aa:BB:cc...` to lower case, rejecting anything that is not
/// six hex octets.
pub fn parse_mac(mac: &str) -> Result<String> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::InvalidMac(mac.to_string()));
    }
    Ok(mac.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("02:84:0A:00:00:05").unwrap(), "02:84:0a:00:00:05");
        assert!(parse_mac("02:84:0a:00:00").is_err());
        assert!(parse_mac("zz:84:0a:00:00:05").is_err());
        assert!(parse_mac("").is_err());
    }
}
