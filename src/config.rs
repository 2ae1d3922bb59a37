use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Which distributed store backs the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Etcd,
    /// Process-local store; single node only.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub endpoints: Vec<String>,
    /// Root of every key the agent writes.
    pub prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".into()],
            prefix: "/vxmesh".into(),
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Local VTEP address; remote hosts tunnel to it. Has no usable
    /// default and must be configured.
    pub host_ip: IpAddr,
    pub store: StoreConfig,
    pub netns_dir: PathBuf,
    pub vxlan_port: u16,
    pub mtu: u32,
    pub vni_max: u32,
    pub lock_ttl_secs: u64,
    pub lock_wait_secs: u64,
    pub netlink_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            host_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            store: StoreConfig::default(),
            netns_dir: PathBuf::from("/var/run/vxmesh/netns"),
            vxlan_port: 4789,
            // 1500 minus the VXLAN/UDP/outer-Ethernet overhead
            mtu: 1450,
            vni_max: 16_777_215,
            lock_ttl_secs: 30,
            lock_wait_secs: 10,
            netlink_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("vxmesh.toml"))
            .merge(Json::file("vxmesh.json"))
            .merge(Env::prefixed("VXMESH_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.hostname.is_none() {
            let name = hostname::get()?
                .into_string()
                .map_err(|_| anyhow::anyhow!("System hostname is not valid UTF-8"))?;
            config.hostname = Some(name);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_ip.is_unspecified() {
            anyhow::bail!("host_ip is not set (VXMESH_HOST_IP or host_ip in vxmesh.toml)");
        }
        // Remote hosts would tunnel to their own loopback.
        if self.host_ip.is_loopback() || self.host_ip.is_multicast() {
            anyhow::bail!("host_ip {} is not reachable from other hosts", self.host_ip);
        }
        if self.mtu == 0 || self.mtu > 1450 {
            anyhow::bail!("mtu must be between 1 and 1450, got {}", self.mtu);
        }
        Ok(())
    }

    /// Hostname used in per-host keys. `load` always fills it in.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or("localhost")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.store.request_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn netlink_timeout(&self) -> Duration {
        Duration::from_secs(self.netlink_timeout_secs)
    }
}
