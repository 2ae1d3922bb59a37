//! `ip(8)`/`bridge(8)` backend.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use super::{Link, Netlink, Netns, VxlanSpec};
use crate::error::{Error, Result};

/// Network namespace of PID 1.
const HOST_NETNS: &str = "/proc/1/ns/net";

/// Messages printed when the object an operation targets does not exist.
const ABSENT_MARKERS: &[&str] = &[
    "Cannot find device",
    "No such device",
    "No such file or directory",
    "No such process",
    "not mounted",
];

#[derive(Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    master: Option<String>,
    address: Option<String>,
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
    info_data: Option<IpLinkData>,
}

#[derive(Deserialize)]
struct IpLinkData {
    id: Option<u32>,
}

#[derive(Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    local: Option<IpAddr>,
    prefixlen: Option<u8>,
}

impl From<IpLink> for Link {
    fn from(raw: IpLink) -> Self {
        let (kind, vni) = match raw.linkinfo {
            Some(info) => {
                let vni = match info.info_kind.as_deref() {
                    Some("vxlan") => info.info_data.and_then(|d| d.id),
                    _ => None,
                };
                (info.info_kind, vni)
            }
            None => (None, None),
        };
        Link {
            index: raw.ifindex,
            up: raw.flags.iter().any(|f| f == "UP"),
            name: raw.ifname,
            mac: raw.address.unwrap_or_default(),
            kind,
            master: raw.master,
            mtu: raw.mtu,
            vni,
        }
    }
}

/// Runs each operation as an `ip`/`bridge` child process, entered into
/// the target namespace with `nsenter`.
pub struct IpCommand {
    timeout: Duration,
}

impl IpCommand {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exec(&self, mut cmd: Command, op: &'static str, target: &str) -> Result<Vec<u8>> {
        cmd.kill_on_drop(true);
        debug!("{}: {:?}", op, cmd.as_std());
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(format!("{} on {}", op, target)))?
            .map_err(|e| Error::netlink(op, target, e))?;

        if !output.status.success() {
            return Err(Error::netlink(
                op,
                target,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(output.stdout)
    }

    async fn tool(
        &self,
        program: &str,
        ns: &Netns,
        op: &'static str,
        target: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let cmd = tool_command(program, ns, args);
        self.exec(cmd, op, &format!("{} in {}", target, ns)).await
    }

    async fn ip(&self, ns: &Netns, op: &'static str, target: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.tool("ip", ns, op, target, args).await
    }

    async fn bridge(&self, ns: &Netns, op: &'static str, target: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.tool("bridge", ns, op, target, args).await
    }
}

/// `program args...` entered into `ns`. The host namespace is entered
/// explicitly too, so it means PID 1's even when the agent runs elsewhere.
fn tool_command(program: &str, ns: &Netns, args: &[&str]) -> Command {
    let path = match ns {
        Netns::Host => Path::new(HOST_NETNS),
        Netns::Path(path) => path.as_path(),
    };
    let mut cmd = Command::new("nsenter");
    cmd.arg(format!("--net={}", path.display()))
        .arg("--")
        .arg(program)
        .args(args);
    cmd
}

/// Map "does not exist" failures to `Ok(false)`.
fn tolerate_absent(result: Result<Vec<u8>>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(Error::Netlink { detail, .. })
            if ABSENT_MARKERS.iter().any(|marker| detail.contains(marker)) =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn netns_arg(target: &Netns) -> String {
    match target {
        Netns::Host => "1".to_string(),
        Netns::Path(path) => path.display().to_string(),
    }
}

#[async_trait]
impl Netlink for IpCommand {
    async fn create_netns(&self, path: &Path) -> Result<()> {
        if self.netns_exists(path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // unshare bind-mounts the new namespace onto an existing file.
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;

        let mut cmd = Command::new("unshare");
        cmd.arg(format!("--net={}", path.display())).arg("true");
        self.exec(cmd, "create netns", &path.display().to_string())
            .await?;
        Ok(())
    }

    async fn delete_netns(&self, path: &Path) -> Result<()> {
        let mut cmd = Command::new("umount");
        cmd.arg(path);
        tolerate_absent(self.exec(cmd, "umount netns", &path.display().to_string()).await)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn netns_exists(&self, path: &Path) -> Result<bool> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        // A handle left behind by a crash is a plain file, not a namespace.
        let mut cmd = Command::new("nsenter");
        cmd.arg(format!("--net={}", path.display())).arg("true");
        Ok(self
            .exec(cmd, "probe netns", &path.display().to_string())
            .await
            .is_ok())
    }

    async fn links(&self, ns: &Netns) -> Result<Vec<Link>> {
        let out = self.ip(ns, "list links", "*", &["-d", "-j", "link", "show"]).await?;
        let raw: Vec<IpLink> = serde_json::from_slice(&out)?;
        Ok(raw.into_iter().map(Link::from).collect())
    }

    async fn add_bridge(&self, ns: &Netns, name: &str) -> Result<()> {
        self.ip(ns, "add bridge", name, &["link", "add", "name", name, "type", "bridge"])
            .await?;
        Ok(())
    }

    async fn add_vxlan(&self, ns: &Netns, name: &str, spec: &VxlanSpec) -> Result<()> {
        let vni = spec.vni.to_string();
        let port = spec.port.to_string();
        let local = spec.local.map(|ip| ip.to_string());
        let mut args = vec![
            "link",
            "add",
            name,
            "type",
            "vxlan",
            "id",
            vni.as_str(),
            "dstport",
            port.as_str(),
        ];
        if let Some(local) = local.as_deref() {
            args.extend(["local", local]);
        }
        if !spec.learning {
            args.push("nolearning");
        }
        self.ip(ns, "add vxlan", name, &args).await?;
        Ok(())
    }

    async fn add_veth(&self, ns: &Netns, name: &str, peer: &str) -> Result<()> {
        self.ip(
            ns,
            "add veth",
            name,
            &["link", "add", name, "type", "veth", "peer", "name", peer],
        )
        .await?;
        Ok(())
    }

    async fn set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()> {
        let target = netns_arg(target);
        self.ip(ns, "move link", name, &["link", "set", "dev", name, "netns", &target])
            .await?;
        Ok(())
    }

    async fn rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()> {
        self.ip(ns, "rename link", name, &["link", "set", "dev", name, "name", new_name])
            .await?;
        Ok(())
    }

    async fn set_mac(&self, ns: &Netns, name: &str, mac: &str) -> Result<()> {
        self.ip(ns, "set mac", name, &["link", "set", "dev", name, "address", mac])
            .await?;
        Ok(())
    }

    async fn set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.ip(ns, "set mtu", name, &["link", "set", "dev", name, "mtu", &mtu])
            .await?;
        Ok(())
    }

    async fn set_master(&self, ns: &Netns, name: &str, master: &str) -> Result<()> {
        self.ip(ns, "set master", name, &["link", "set", "dev", name, "master", master])
            .await?;
        Ok(())
    }

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<()> {
        self.ip(ns, "set up", name, &["link", "set", "dev", name, "up"])
            .await?;
        Ok(())
    }

    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<bool> {
        tolerate_absent(self.ip(ns, "delete link", name, &["link", "del", "dev", name]).await)
    }

    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<IpNet>> {
        let out = self
            .ip(ns, "list addresses", name, &["-j", "addr", "show", "dev", name])
            .await?;
        let entries: Vec<IpAddrEntry> = serde_json::from_slice(&out)?;
        Ok(entries
            .into_iter()
            .flat_map(|entry| entry.addr_info)
            .filter_map(|info| IpNet::new(info.local?, info.prefixlen?).ok())
            .collect())
    }

    async fn add_address(&self, ns: &Netns, name: &str, address: IpNet) -> Result<()> {
        let address = address.to_string();
        self.ip(ns, "add address", name, &["addr", "add", &address, "dev", name])
            .await?;
        Ok(())
    }

    async fn neigh_replace(&self, ns: &Netns, dev: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let ip = ip.to_string();
        self.ip(
            ns,
            "replace neighbor",
            dev,
            &["neigh", "replace", &ip, "lladdr", mac, "dev", dev, "nud", "permanent"],
        )
        .await?;
        Ok(())
    }

    async fn neigh_delete(&self, ns: &Netns, dev: &str, ip: IpAddr) -> Result<bool> {
        let ip = ip.to_string();
        tolerate_absent(
            self.ip(ns, "delete neighbor", dev, &["neigh", "del", &ip, "dev", dev])
                .await,
        )
    }

    async fn fdb_replace(&self, ns: &Netns, dev: &str, mac: &str, dst: IpAddr) -> Result<()> {
        let dst = dst.to_string();
        self.bridge(
            ns,
            "replace fdb",
            dev,
            &["fdb", "replace", mac, "dev", dev, "dst", &dst, "self", "permanent"],
        )
        .await?;
        Ok(())
    }

    async fn fdb_delete(&self, ns: &Netns, dev: &str, mac: &str, dst: IpAddr) -> Result<bool> {
        let dst = dst.to_string();
        tolerate_absent(
            self.bridge(
                ns,
                "delete fdb",
                dev,
                &["fdb", "del", mac, "dev", dev, "dst", &dst, "self"],
            )
            .await,
        )
    }
}
