//! VXLAN overlay fabric.
//!
//! Per network and host: a namespace holding bridge `br0` (carrying the
//! gateway address) and VXLAN device `vxlan0` enslaved to it. Workloads
//! attach through veth pairs whose overlay leg joins the bridge. Remote
//! endpoints are reached through static ARP and FDB entries on `vxlan0`
//! pushed by the control plane; the device itself does not learn.
//!
//! Apart from a veth pair that never got recorded, nothing is rolled back
//! on failure. Every step checks whether its result already exists, so
//! calling again resumes from partial state.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{ActivateOptions, NetworkManager};
use crate::error::{Error, Result};
use crate::netlink::{self, find_link, find_link_by_mac, Link, Netlink, Netns, VxlanSpec};
use crate::types::{Endpoint, Network};

pub const BRIDGE_NAME: &str = "br0";
pub const VXLAN_NAME: &str = "vxlan0";
/// Overlay-side veth legs; their presence blocks network deactivation.
pub const ENDPOINT_IFACE_PREFIX: &str = "ve-";
/// Workload-side veth legs, until the workload renames them.
pub const TARGET_IFACE_PREFIX: &str = "vc-";
/// VXLAN devices between creation in the host namespace and rename.
const VXLAN_TEMP_PREFIX: &str = "vxt-";

const NAME_ATTEMPTS: usize = 16;

fn random_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &suffix[..8])
}

pub struct OverlayManager {
    netlink: Arc<dyn Netlink>,
    host_ip: IpAddr,
    vxlan_port: u16,
    mtu: u32,
}

impl OverlayManager {
    pub fn new(netlink: Arc<dyn Netlink>, host_ip: IpAddr, vxlan_port: u16, mtu: u32) -> Self {
        Self {
            netlink,
            host_ip,
            vxlan_port,
            mtu,
        }
    }

    fn overlay_ns(network: &Network) -> Netns {
        Netns::Path(network.netns.clone())
    }

    async fn set_up_if_down(&self, ns: &Netns, links: &[Link], name: &str) -> Result<()> {
        match find_link(links, name) {
            Some(link) if link.up => Ok(()),
            _ => self.netlink.set_up(ns, name).await,
        }
    }

    /// Create the VXLAN device in the host namespace, where the kernel
    /// sees the underlay, then move it into `ns` under its final name.
    async fn create_vxlan(&self, network: &Network, ns: &Netns) -> Result<()> {
        let host_links = self.netlink.links(&Netns::Host).await?;
        let temp = (0..NAME_ATTEMPTS)
            .map(|_| random_name(VXLAN_TEMP_PREFIX))
            .find(|name| find_link(&host_links, name).is_none())
            .ok_or_else(|| Error::netlink("add vxlan", "host", "no free interface name"))?;

        let spec = VxlanSpec {
            vni: network.vni,
            port: self.vxlan_port,
            local: Some(self.host_ip),
            learning: false,
        };
        self.netlink.add_vxlan(&Netns::Host, &temp, &spec).await?;
        if let Err(e) = self.netlink.set_netns(&Netns::Host, &temp, ns).await {
            // Nothing would ever find a randomly named device left on the host.
            let _ = self.netlink.delete_link(&Netns::Host, &temp).await;
            return Err(e);
        }
        self.netlink.rename(ns, &temp, VXLAN_NAME).await?;
        info!(
            "Created {} (vni {}) in {}",
            VXLAN_NAME,
            network.vni,
            network.netns.display()
        );
        Ok(())
    }

    /// Pick unused names for both veth legs.
    async fn endpoint_names(&self, namespaces: &[&Netns]) -> Result<(String, String)> {
        let mut taken = Vec::new();
        for ns in namespaces {
            taken.extend(self.netlink.links(ns).await?.into_iter().map(|l| l.name));
        }
        let fresh = |prefix: &str| {
            (0..NAME_ATTEMPTS)
                .map(|_| random_name(prefix))
                .find(|name| !taken.contains(name))
                .ok_or_else(|| Error::netlink("add veth", "host", "no free interface name"))
        };
        let overlay = fresh(ENDPOINT_IFACE_PREFIX)?;
        let target = fresh(TARGET_IFACE_PREFIX)?;
        Ok((overlay, target))
    }

    /// Attach, address and bring up an existing pair. Only touches what is
    /// not already in place.
    async fn wire_endpoint(
        &self,
        overlay_ns: &Netns,
        target_ns: &Netns,
        endpoint: &Endpoint,
        opts: &ActivateOptions,
    ) -> Result<()> {
        let overlay_links = self.netlink.links(overlay_ns).await?;
        let overlay = find_link(&overlay_links, &endpoint.overlay_iface).ok_or_else(|| {
            Error::netlink("lookup", endpoint.overlay_iface.clone(), "Cannot find device")
        })?;
        if overlay.master.as_deref() != Some(BRIDGE_NAME) {
            self.netlink
                .set_master(overlay_ns, &endpoint.overlay_iface, BRIDGE_NAME)
                .await?;
        }

        if !opts.skip_address {
            if let Some(address) = endpoint.target_ip {
                let present = self
                    .netlink
                    .addresses(target_ns, &endpoint.target_iface)
                    .await?;
                if !present.contains(&address) {
                    self.netlink
                        .add_address(target_ns, &endpoint.target_iface, address)
                        .await?;
                }
            }
        }

        self.set_up_if_down(overlay_ns, &overlay_links, &endpoint.overlay_iface)
            .await?;
        let target_links = self.netlink.links(target_ns).await?;
        self.set_up_if_down(target_ns, &target_links, &endpoint.target_iface)
            .await
    }

    async fn create_endpoint(
        &self,
        overlay_ns: &Netns,
        target_ns: &Netns,
        endpoint: &mut Endpoint,
        mac: &str,
        opts: &ActivateOptions,
    ) -> Result<()> {
        self.remove_stale_pairs(target_ns, endpoint, mac).await?;
        let (overlay_name, target_name) = self
            .endpoint_names(&[&Netns::Host, overlay_ns, target_ns])
            .await?;

        self.netlink
            .add_veth(&Netns::Host, &overlay_name, &target_name)
            .await?;
        if let Err(e) = self
            .place_pair(overlay_ns, target_ns, &overlay_name, &target_name, mac, opts)
            .await
        {
            // The record is not saved on failure, so nothing would find the pair again.
            for ns in [overlay_ns, &Netns::Host] {
                match self.netlink.delete_link(ns, &overlay_name).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(cleanup) => {
                        warn!("Failed to remove {} in {}: {}", overlay_name, ns, cleanup)
                    }
                }
            }
            return Err(e);
        }

        endpoint.overlay_iface = overlay_name;
        endpoint.target_iface = target_name;
        endpoint.target_mac = mac.to_string();
        self.wire_endpoint(overlay_ns, target_ns, endpoint, opts).await?;

        let overlay_links = self.netlink.links(overlay_ns).await?;
        endpoint.overlay_mac = find_link(&overlay_links, &endpoint.overlay_iface)
            .map(|l| l.mac.clone())
            .unwrap_or_default();
        info!(
            "Created veth {}<->{} for endpoint {}",
            endpoint.overlay_iface, endpoint.target_iface, endpoint.id
        );
        Ok(())
    }

    /// Move a fresh pair into place and size it.
    async fn place_pair(
        &self,
        overlay_ns: &Netns,
        target_ns: &Netns,
        overlay_name: &str,
        target_name: &str,
        mac: &str,
        opts: &ActivateOptions,
    ) -> Result<()> {
        self.netlink
            .set_netns(&Netns::Host, overlay_name, overlay_ns)
            .await?;
        self.netlink.set_mac(&Netns::Host, target_name, mac).await?;
        if !opts.skip_netns_move {
            self.netlink
                .set_netns(&Netns::Host, target_name, target_ns)
                .await?;
        }
        self.netlink.set_mtu(overlay_ns, overlay_name, self.mtu).await?;
        self.netlink.set_mtu(target_ns, target_name, self.mtu).await
    }

    /// Delete veth legs carrying the endpoint's MAC that an interrupted
    /// activation left behind. Deleting either leg takes its peer along.
    async fn remove_stale_pairs(
        &self,
        target_ns: &Netns,
        endpoint: &Endpoint,
        mac: &str,
    ) -> Result<()> {
        let host = Netns::Host;
        let mut namespaces = vec![target_ns];
        if *target_ns != host {
            namespaces.push(&host);
        }
        for ns in namespaces {
            let stale: Vec<String> = self
                .netlink
                .links(ns)
                .await?
                .into_iter()
                .filter(|l| l.kind.as_deref() == Some("veth") && l.mac.eq_ignore_ascii_case(mac))
                .map(|l| l.name)
                .collect();
            for name in stale {
                warn!(
                    "Endpoint {}: removing stale {} with MAC {} in {}",
                    endpoint.id, name, mac, ns
                );
                self.netlink.delete_link(ns, &name).await?;
            }
        }
        Ok(())
    }

    /// Parse what neighbor programming needs from an endpoint record.
    fn neigh_params(endpoint: &Endpoint) -> Result<(IpAddr, String, IpAddr)> {
        let host_ip = endpoint.host_ip.ok_or_else(|| {
            Error::InvalidInput(format!("endpoint {} has no host IP", endpoint.id))
        })?;
        let ip = endpoint
            .target_ip
            .ok_or_else(|| Error::InvalidInput(format!("endpoint {} has no address", endpoint.id)))?
            .addr();
        let mac = netlink::parse_mac(&endpoint.target_mac)?;
        Ok((ip, mac, host_ip))
    }

    async fn require_vxlan(&self, network: &Network, ns: &Netns) -> Result<()> {
        let links = self.netlink.links(ns).await?;
        if find_link(&links, VXLAN_NAME).is_none() {
            return Err(Error::netlink(
                "lookup",
                format!("{} in {}", VXLAN_NAME, network.netns.display()),
                "Cannot find device",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for OverlayManager {
    async fn ensure(&self, network: &Network) -> Result<()> {
        self.netlink.create_netns(&network.netns).await?;
        let ns = Self::overlay_ns(network);

        let links = self.netlink.links(&ns).await?;
        if find_link(&links, BRIDGE_NAME).is_none() {
            self.netlink.add_bridge(&ns, BRIDGE_NAME).await?;
            info!("Created {} in {}", BRIDGE_NAME, network.netns.display());
        }

        let addrs = self.netlink.addresses(&ns, BRIDGE_NAME).await?;
        let gateway = network.gateway;
        if !addrs.iter().any(|a| a.addr().is_ipv4() == gateway.addr().is_ipv4()) {
            self.netlink.add_address(&ns, BRIDGE_NAME, gateway).await?;
        }

        if find_link(&links, VXLAN_NAME).is_none() {
            let stranded = links.iter().find(|l| {
                l.name.starts_with(VXLAN_TEMP_PREFIX) && l.kind.as_deref() == Some("vxlan")
            });
            match stranded {
                Some(link) => {
                    debug!("Resuming rename of {} in {}", link.name, ns);
                    self.netlink.rename(&ns, &link.name, VXLAN_NAME).await?;
                }
                None => self.create_vxlan(network, &ns).await?,
            }
        }

        let mut links = self.netlink.links(&ns).await?;
        let stale_vni = find_link(&links, VXLAN_NAME)
            .and_then(|l| l.vni)
            .filter(|vni| *vni != network.vni);
        if let Some(vni) = stale_vni {
            // Left over from an earlier network of the same name.
            warn!(
                "{} in {} carries vni {} but network {} has vni {}, replacing it",
                VXLAN_NAME, ns, vni, network.id, network.vni
            );
            self.netlink.delete_link(&ns, VXLAN_NAME).await?;
            self.create_vxlan(network, &ns).await?;
            links = self.netlink.links(&ns).await?;
        }
        let vxlan = find_link(&links, VXLAN_NAME).ok_or_else(|| {
            Error::netlink("lookup", format!("{} in {}", VXLAN_NAME, ns), "Cannot find device")
        })?;
        if vxlan.master.as_deref() != Some(BRIDGE_NAME) {
            self.netlink.set_master(&ns, VXLAN_NAME, BRIDGE_NAME).await?;
        }

        for name in ["lo", BRIDGE_NAME, VXLAN_NAME] {
            self.set_up_if_down(&ns, &links, name).await?;
        }
        Ok(())
    }

    async fn deactivate(&self, network: &Network) -> Result<()> {
        if !self.netlink.netns_exists(&network.netns).await? {
            return Ok(());
        }
        let ns = Self::overlay_ns(network);
        let links = self.netlink.links(&ns).await?;
        if let Some(link) = links
            .iter()
            .find(|l| l.name.starts_with(ENDPOINT_IFACE_PREFIX))
        {
            return Err(Error::EndpointStillPresent {
                namespace: network.netns.clone(),
                interface: link.name.clone(),
            });
        }
        self.netlink.delete_link(&ns, VXLAN_NAME).await?;
        self.netlink.delete_link(&ns, BRIDGE_NAME).await?;
        info!("Deactivated network {} in {}", network.id, ns);
        Ok(())
    }

    async fn delete(&self, network: &Network) -> Result<()> {
        self.deactivate(network).await?;
        self.netlink.delete_netns(&network.netns).await?;
        info!("Removed namespace {}", network.netns.display());
        Ok(())
    }

    async fn ensure_endpoint(
        &self,
        network: &Network,
        endpoint: &mut Endpoint,
        opts: &ActivateOptions,
    ) -> Result<()> {
        if opts.netns.is_empty() {
            return Err(Error::InvalidInput(format!(
                "endpoint {} needs a target namespace",
                endpoint.id
            )));
        }
        let mac = netlink::parse_mac(&endpoint.target_mac)?;
        let overlay_ns = Self::overlay_ns(network);
        let target_ns = if opts.skip_netns_move {
            Netns::Host
        } else {
            Netns::path(&opts.netns)
        };

        if !endpoint.overlay_iface.is_empty() {
            let overlay_links = self.netlink.links(&overlay_ns).await?;
            if find_link(&overlay_links, &endpoint.overlay_iface).is_some() {
                // The workload may have renamed its leg; the MAC is ours.
                let target_links = self.netlink.links(&target_ns).await?;
                if let Some(target) = find_link_by_mac(&target_links, &mac) {
                    endpoint.target_iface = target.name.clone();
                    return self
                        .wire_endpoint(&overlay_ns, &target_ns, endpoint, opts)
                        .await;
                }
                warn!(
                    "Endpoint {}: {} exists but no link with MAC {} in {}, recreating pair",
                    endpoint.id, endpoint.overlay_iface, mac, target_ns
                );
                self.netlink
                    .delete_link(&overlay_ns, &endpoint.overlay_iface)
                    .await?;
            }
        }

        self.create_endpoint(&overlay_ns, &target_ns, endpoint, &mac, opts)
            .await
    }

    async fn delete_endpoint(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        if endpoint.overlay_iface.is_empty() {
            return Err(Error::EndpointDisabled(endpoint.id.clone()));
        }
        let overlay_ns = Self::overlay_ns(network);
        self.netlink
            .delete_link(&overlay_ns, &endpoint.overlay_iface)
            .await?;
        // A leg stranded in the host namespace by an interrupted activation.
        self.netlink
            .delete_link(&Netns::Host, &endpoint.overlay_iface)
            .await?;
        if !endpoint.target_iface.is_empty() {
            if !endpoint.netns.is_empty() {
                self.netlink
                    .delete_link(&Netns::path(&endpoint.netns), &endpoint.target_iface)
                    .await?;
            }
            self.netlink
                .delete_link(&Netns::Host, &endpoint.target_iface)
                .await?;
        }
        info!("Removed wiring of endpoint {}", endpoint.id);
        Ok(())
    }

    async fn add_endpoint_neigh(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let (ip, mac, host_ip) = Self::neigh_params(endpoint)?;
        if host_ip == self.host_ip {
            return Ok(());
        }
        let ns = Self::overlay_ns(network);
        self.require_vxlan(network, &ns).await?;
        self.netlink.neigh_replace(&ns, VXLAN_NAME, ip, &mac).await?;
        self.netlink
            .fdb_replace(&ns, VXLAN_NAME, &mac, host_ip)
            .await?;
        debug!("Programmed {} ({}) via {} in {}", ip, mac, host_ip, ns);
        Ok(())
    }

    async fn remove_endpoint_neigh(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let (ip, mac, host_ip) = Self::neigh_params(endpoint)?;
        if host_ip == self.host_ip {
            return Ok(());
        }
        let ns = Self::overlay_ns(network);
        self.require_vxlan(network, &ns).await?;
        self.netlink.neigh_delete(&ns, VXLAN_NAME, ip).await?;
        self.netlink
            .fdb_delete(&ns, VXLAN_NAME, &mac, host_ip)
            .await?;
        debug!("Removed {} ({}) via {} from {}", ip, mac, host_ip, ns);
        Ok(())
    }
}
