//! vxmesh: per-host control plane of a VXLAN overlay.
//!
//! Networks and endpoints live in a distributed store shared by every
//! host. Each host builds the kernel side of the networks it carries
//! (namespace, bridge, VXLAN device, veth pairs) and keeps the static
//! neighbor tables of those networks in sync with the endpoints other
//! hosts publish.

pub mod agent;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod idalloc;
pub mod ipam;
pub mod neigh;
pub mod netlink;
pub mod network;
pub mod reconcile;
pub mod store;
pub mod tunnel;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, Result};
