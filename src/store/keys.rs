//! Key layout under the configured store prefix.
//!
//! ```text
//! <prefix>/networks/<network>
//! <prefix>/endpoints/host/<hostname>/<endpoint>
//! <prefix>/endpoints/network/<network>/<endpoint>
//! <prefix>/ipam/<scope>
//! <prefix>/nodes/<hostname>/networks/<network>
//! <prefix>/bindings/<plugin-id>
//! <prefix>/locks/<name>
//! ```
//!
//! Directory-style prefixes always end in `/` so that a watch on one
//! network never sees a sibling whose id shares a prefix.

#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn networks(&self) -> String {
        format!("{}/networks/", self.prefix)
    }

    pub fn network(&self, id: &str) -> String {
        format!("{}/networks/{}", self.prefix, id)
    }

    pub fn host_endpoints(&self, hostname: &str) -> String {
        format!("{}/endpoints/host/{}/", self.prefix, hostname)
    }

    pub fn host_endpoint(&self, hostname: &str, id: &str) -> String {
        format!("{}{}", self.host_endpoints(hostname), id)
    }

    /// Parent of every per-host endpoint copy.
    pub fn all_host_endpoints(&self) -> String {
        format!("{}/endpoints/host/", self.prefix)
    }

    pub fn network_endpoints(&self, network_id: &str) -> String {
        format!("{}/endpoints/network/{}/", self.prefix, network_id)
    }

    pub fn network_endpoint(&self, network_id: &str, id: &str) -> String {
        format!("{}{}", self.network_endpoints(network_id), id)
    }

    /// Parent of every per-network endpoint copy.
    pub fn all_network_endpoints(&self) -> String {
        format!("{}/endpoints/network/", self.prefix)
    }

    pub fn ip_pool(&self, scope: &str) -> String {
        format!("{}/ipam/{}", self.prefix, scope)
    }

    pub fn node_networks(&self, hostname: &str) -> String {
        format!("{}/nodes/{}/networks/", self.prefix, hostname)
    }

    pub fn node_network(&self, hostname: &str, network_id: &str) -> String {
        format!("{}{}", self.node_networks(hostname), network_id)
    }

    pub fn plugin_binding(&self, plugin_id: &str) -> String {
        format!("{}/bindings/{}", self.prefix, plugin_id)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}/locks/{}", self.prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_trailing_slash_is_normalised() {
        let keys = Keys::new("/vxmesh/");
        assert_eq!(keys.network("n1"), "/vxmesh/networks/n1");
        assert_eq!(keys.host_endpoint("h1", "e1"), "/vxmesh/endpoints/host/h1/e1");
    }

    #[test]
    fn test_network_endpoint_prefix_does_not_match_sibling() {
        let keys = Keys::new("/vxmesh");
        let watched = keys.network_endpoints("n1");
        let sibling = keys.network_endpoint("n10", "e1");
        assert!(!sibling.starts_with(&watched));
        assert!(keys.network_endpoint("n1", "e1").starts_with(&watched));
    }
}
