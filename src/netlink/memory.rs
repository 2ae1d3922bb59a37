//! In-memory kernel model for tests: namespaces holding links, addresses,
//! neighbor and FDB tables, with veth pairs deleted together and links
//! reset when moved between namespaces.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{Link, Netlink, Netns, VxlanSpec};
use crate::error::{Error, Result};

struct MemLink {
    link: Link,
    addrs: Vec<IpNet>,
    peer: Option<u32>,
}

#[derive(Default)]
struct NsState {
    links: Vec<MemLink>,
    neigh: HashMap<(String, IpAddr), String>,
    fdb: HashMap<(String, String), IpAddr>,
}

impl NsState {
    fn link_mut(&mut self, name: &str) -> Result<&mut MemLink> {
        self.links
            .iter_mut()
            .find(|l| l.link.name == name)
            .ok_or_else(|| Error::netlink("lookup", name, format!("Cannot find device \"{}\"", name)))
    }

    fn has(&self, name: &str) -> bool {
        self.links.iter().any(|l| l.link.name == name)
    }
}

#[derive(Default)]
struct State {
    namespaces: HashMap<Netns, NsState>,
    next_index: u32,
    ops: Vec<String>,
    /// Operations that fail once, the next time they run.
    faults: Vec<&'static str>,
}

impl State {
    fn ns_mut(&mut self, ns: &Netns) -> Result<&mut NsState> {
        self.namespaces
            .get_mut(ns)
            .ok_or_else(|| Error::netlink("enter", ns.to_string(), "No such file or directory"))
    }

    fn fault(&mut self, op: &'static str, name: &str) -> Result<()> {
        match self.faults.iter().position(|f| *f == op) {
            Some(pos) => {
                self.faults.remove(pos);
                Err(Error::netlink(op, name, "injected"))
            }
            None => Ok(()),
        }
    }

    fn new_link(&mut self, name: &str, kind: Option<&str>) -> MemLink {
        self.next_index += 1;
        let index = self.next_index;
        MemLink {
            link: Link {
                index,
                name: name.to_string(),
                mac: format!("02:00:00:00:{:02x}:{:02x}", index >> 8, index & 0xff),
                kind: kind.map(str::to_string),
                master: None,
                up: false,
                mtu: 1500,
                vni: None,
            },
            addrs: Vec::new(),
            peer: None,
        }
    }

    fn insert(&mut self, ns: &Netns, link: MemLink) -> Result<()> {
        let state = self.ns_mut(ns)?;
        if state.has(&link.link.name) {
            return Err(Error::netlink("add", link.link.name.clone(), "File exists"));
        }
        state.links.push(link);
        Ok(())
    }

    fn add_namespace(&mut self, ns: Netns) {
        let lo = self.new_link("lo", None);
        let mut state = NsState::default();
        state.links.push(lo);
        self.namespaces.insert(ns, state);
    }

    /// Remove the link with `index` from whichever namespace holds it.
    fn remove_index(&mut self, index: u32) -> Option<MemLink> {
        for state in self.namespaces.values_mut() {
            if let Some(pos) = state.links.iter().position(|l| l.link.index == index) {
                let removed = state.links.remove(pos);
                for link in state.links.iter_mut() {
                    if link.link.master.as_deref() == Some(removed.link.name.as_str()) {
                        link.link.master = None;
                    }
                }
                return Some(removed);
            }
        }
        None
    }
}

pub(crate) struct MemoryNetlink {
    state: Mutex<State>,
}

impl MemoryNetlink {
    pub(crate) fn new() -> Self {
        let mut state = State::default();
        state.add_namespace(Netns::Host);
        let eth0 = state.new_link("eth0", None);
        state
            .namespaces
            .get_mut(&Netns::Host)
            .expect("host namespace")
            .links
            .push(eth0);
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a namespace exist, as a container runtime would.
    pub(crate) fn add_namespace(&self, path: &str) {
        self.state().add_namespace(Netns::path(path));
    }

    pub(crate) fn remove_namespace(&self, path: &str) {
        self.state().namespaces.remove(&Netns::path(path));
    }

    pub(crate) fn snapshot(&self, ns: &Netns) -> Vec<Link> {
        self.state()
            .namespaces
            .get(ns)
            .map(|s| s.links.iter().map(|l| l.link.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn addrs_of(&self, ns: &Netns, name: &str) -> Vec<IpNet> {
        self.state()
            .namespaces
            .get(ns)
            .and_then(|s| s.links.iter().find(|l| l.link.name == name))
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    pub(crate) fn neighbors(&self, ns: &Netns) -> Vec<(String, IpAddr, String)> {
        self.state()
            .namespaces
            .get(ns)
            .map(|s| {
                s.neigh
                    .iter()
                    .map(|((dev, ip), mac)| (dev.clone(), *ip, mac.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn fdb(&self, ns: &Netns) -> Vec<(String, String, IpAddr)> {
        self.state()
            .namespaces
            .get(ns)
            .map(|s| {
                s.fdb
                    .iter()
                    .map(|((dev, mac), dst)| (dev.clone(), mac.clone(), *dst))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mutating operations performed so far, in order.
    pub(crate) fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Make the next call of `op` (e.g. `"set_mtu"`) fail.
    pub(crate) fn fail_next(&self, op: &'static str) {
        self.state().faults.push(op);
    }

    /// Change a link's MAC behind the agent's back.
    pub(crate) fn tamper_mac(&self, ns: &Netns, name: &str, mac: &str) {
        if let Ok(state) = self.state().ns_mut(ns) {
            if let Ok(link) = state.link_mut(name) {
                link.link.mac = mac.to_string();
            }
        }
    }
}

#[async_trait]
impl Netlink for MemoryNetlink {
    async fn create_netns(&self, path: &Path) -> Result<()> {
        let ns = Netns::path(path);
        let mut state = self.state();
        if !state.namespaces.contains_key(&ns) {
            state.add_namespace(ns);
            state.ops.push(format!("create_netns {}", path.display()));
        }
        Ok(())
    }

    async fn delete_netns(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        if state.namespaces.remove(&Netns::path(path)).is_some() {
            state.ops.push(format!("delete_netns {}", path.display()));
        }
        Ok(())
    }

    async fn netns_exists(&self, path: &Path) -> Result<bool> {
        Ok(self.state().namespaces.contains_key(&Netns::path(path)))
    }

    async fn links(&self, ns: &Netns) -> Result<Vec<Link>> {
        let mut state = self.state();
        let ns_state = state.ns_mut(ns)?;
        Ok(ns_state.links.iter().map(|l| l.link.clone()).collect())
    }

    async fn add_bridge(&self, ns: &Netns, name: &str) -> Result<()> {
        let mut state = self.state();
        let link = state.new_link(name, Some("bridge"));
        state.insert(ns, link)?;
        state.ops.push(format!("add_bridge {} {}", ns, name));
        Ok(())
    }

    async fn add_vxlan(&self, ns: &Netns, name: &str, spec: &VxlanSpec) -> Result<()> {
        let mut state = self.state();
        let mut link = state.new_link(name, Some("vxlan"));
        link.link.vni = Some(spec.vni);
        state.insert(ns, link)?;
        state.ops.push(format!("add_vxlan {} {} {}", ns, name, spec.vni));
        Ok(())
    }

    async fn add_veth(&self, ns: &Netns, name: &str, peer: &str) -> Result<()> {
        let mut state = self.state();
        if state.ns_mut(ns)?.has(peer) {
            return Err(Error::netlink("add veth", peer, "File exists"));
        }
        let mut a = state.new_link(name, Some("veth"));
        let mut b = state.new_link(peer, Some("veth"));
        a.peer = Some(b.link.index);
        b.peer = Some(a.link.index);
        state.insert(ns, a)?;
        state.insert(ns, b)?;
        state.ops.push(format!("add_veth {} {} {}", ns, name, peer));
        Ok(())
    }

    async fn set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()> {
        let mut state = self.state();
        state.fault("set_netns", name)?;
        if state.ns_mut(target)?.has(name) {
            return Err(Error::netlink("move link", name, "File exists"));
        }
        let index = state.ns_mut(ns)?.link_mut(name)?.link.index;
        let mut link = state
            .remove_index(index)
            .ok_or_else(|| Error::netlink("move link", name, "Cannot find device"))?;
        link.link.master = None;
        link.link.up = false;
        link.addrs.clear();
        state.insert(target, link)?;
        state.ops.push(format!("set_netns {} {} {}", ns, name, target));
        Ok(())
    }

    async fn rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()> {
        let mut state = self.state();
        let ns_state = state.ns_mut(ns)?;
        if ns_state.has(new_name) {
            return Err(Error::netlink("rename link", name, "File exists"));
        }
        ns_state.link_mut(name)?.link.name = new_name.to_string();
        state.ops.push(format!("rename {} {} {}", ns, name, new_name));
        Ok(())
    }

    async fn set_mac(&self, ns: &Netns, name: &str, mac: &str) -> Result<()> {
        let mut state = self.state();
        state.ns_mut(ns)?.link_mut(name)?.link.mac = mac.to_string();
        state.ops.push(format!("set_mac {} {} {}", ns, name, mac));
        Ok(())
    }

    async fn set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()> {
        let mut state = self.state();
        state.fault("set_mtu", name)?;
        state.ns_mut(ns)?.link_mut(name)?.link.mtu = mtu;
        state.ops.push(format!("set_mtu {} {} {}", ns, name, mtu));
        Ok(())
    }

    async fn set_master(&self, ns: &Netns, name: &str, master: &str) -> Result<()> {
        let mut state = self.state();
        let ns_state = state.ns_mut(ns)?;
        let is_bridge = ns_state
            .links
            .iter()
            .any(|l| l.link.name == master && l.link.kind.as_deref() == Some("bridge"));
        if !is_bridge {
            return Err(Error::netlink("set master", name, "Cannot find device"));
        }
        ns_state.link_mut(name)?.link.master = Some(master.to_string());
        state.ops.push(format!("set_master {} {} {}", ns, name, master));
        Ok(())
    }

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<()> {
        let mut state = self.state();
        state.ns_mut(ns)?.link_mut(name)?.link.up = true;
        state.ops.push(format!("set_up {} {}", ns, name));
        Ok(())
    }

    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<bool> {
        let mut state = self.state();
        let Ok(ns_state) = state.ns_mut(ns) else {
            return Ok(false);
        };
        let index = match ns_state.link_mut(name) {
            Ok(link) => link.link.index,
            Err(_) => return Ok(false),
        };
        if let Some(removed) = state.remove_index(index) {
            if let Some(peer) = removed.peer {
                state.remove_index(peer);
            }
        }
        state.ops.push(format!("delete_link {} {}", ns, name));
        Ok(true)
    }

    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<IpNet>> {
        let mut state = self.state();
        Ok(state.ns_mut(ns)?.link_mut(name)?.addrs.clone())
    }

    async fn add_address(&self, ns: &Netns, name: &str, address: IpNet) -> Result<()> {
        let mut state = self.state();
        let link = state.ns_mut(ns)?.link_mut(name)?;
        if link.addrs.contains(&address) {
            return Err(Error::netlink("add address", name, "RTNETLINK answers: File exists"));
        }
        link.addrs.push(address);
        state.ops.push(format!("add_address {} {} {}", ns, name, address));
        Ok(())
    }

    async fn neigh_replace(&self, ns: &Netns, dev: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let mut state = self.state();
        let ns_state = state.ns_mut(ns)?;
        ns_state.link_mut(dev)?;
        ns_state.neigh.insert((dev.to_string(), ip), mac.to_string());
        state.ops.push(format!("neigh_replace {} {} {} {}", ns, dev, ip, mac));
        Ok(())
    }

    async fn neigh_delete(&self, ns: &Netns, dev: &str, ip: IpAddr) -> Result<bool> {
        let mut state = self.state();
        let removed = state
            .ns_mut(ns)?
            .neigh
            .remove(&(dev.to_string(), ip))
            .is_some();
        state.ops.push(format!("neigh_delete {} {} {}", ns, dev, ip));
        Ok(removed)
    }

    async fn fdb_replace(&self, ns: &Netns, dev: &str, mac: &str, dst: IpAddr) -> Result<()> {
        let mut state = self.state();
        let ns_state = state.ns_mut(ns)?;
        ns_state.link_mut(dev)?;
        ns_state.fdb.insert((dev.to_string(), mac.to_string()), dst);
        state.ops.push(format!("fdb_replace {} {} {} {}", ns, dev, mac, dst));
        Ok(())
    }

    async fn fdb_delete(&self, ns: &Netns, dev: &str, mac: &str, _dst: IpAddr) -> Result<bool> {
        let mut state = self.state();
        let removed = state
            .ns_mut(ns)?
            .fdb
            .remove(&(dev.to_string(), mac.to_string()))
            .is_some();
        state.ops.push(format!("fdb_delete {} {} {}", ns, dev, mac));
        Ok(removed)
    }
}
