use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::Peers;
use crate::constants::IPV4_PREFIX_KEY;
use crate::constants::IPV6_PREFIX_KEY;
use crate::constants::MESH_DOMAIN_KEY;
use crate::storage::MeshStorage;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::Result;

/// Mesh-wide settings and derived address listings
#[derive(Clone)]
pub struct MeshState {
    db: Arc<dyn MeshStorage>,
}

impl MeshState {
    pub fn new(db: Arc<dyn MeshStorage>) -> Self {
        Self { db }
    }

    pub async fn get_ipv6_prefix(&self) -> Result<IpPrefix> {
        self.get_prefix(IPV6_PREFIX_KEY).await
    }

    pub async fn set_ipv6_prefix(
        &self,
        prefix: &IpPrefix,
    ) -> Result<()> {
        if !prefix.is_ipv6() {
            return Err(Error::InvalidArgument(format!("{} is not an IPv6 prefix", prefix)));
        }
        self.db.put_value(IPV6_PREFIX_KEY, prefix.to_string().into_bytes()).await
    }

    pub async fn get_ipv4_prefix(&self) -> Result<IpPrefix> {
        self.get_prefix(IPV4_PREFIX_KEY).await
    }

    pub async fn set_ipv4_prefix(
        &self,
        prefix: &IpPrefix,
    ) -> Result<()> {
        if !prefix.is_ipv4() {
            return Err(Error::InvalidArgument(format!("{} is not an IPv4 prefix", prefix)));
        }
        self.db.put_value(IPV4_PREFIX_KEY, prefix.to_string().into_bytes()).await
    }

    pub async fn get_mesh_domain(&self) -> Result<String> {
        let bytes = self.db.get_value(MESH_DOMAIN_KEY).await?;
        String::from_utf8(bytes)
            .map_err(|e| Error::InvalidArgument(format!("mesh domain is not utf-8: {}", e)))
    }

    pub async fn set_mesh_domain(
        &self,
        domain: &str,
    ) -> Result<()> {
        self.db.put_value(MESH_DOMAIN_KEY, domain.as_bytes().to_vec()).await
    }

    /// Node id to public RPC address, for every node that has one
    pub async fn list_public_rpc_addresses(&self) -> Result<BTreeMap<String, SocketAddr>> {
        let nodes = Peers::new(self.db.clone()).list_public_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| n.public_rpc_addr().map(|addr| (n.id, addr)))
            .collect())
    }

    pub async fn list_peer_public_rpc_addresses(
        &self,
        exclude: &str,
    ) -> Result<BTreeMap<String, SocketAddr>> {
        let mut addrs = self.list_public_rpc_addresses().await?;
        addrs.remove(exclude);
        Ok(addrs)
    }

    /// Private RPC address of every other node, IPv4 preferred
    pub async fn list_peer_private_rpc_addresses(
        &self,
        exclude: &str,
    ) -> Result<BTreeMap<String, SocketAddr>> {
        let nodes = Peers::new(self.db.clone()).list().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.id != exclude)
            .filter_map(|n| {
                n.private_rpc_addr_v4()
                    .or_else(|| n.private_rpc_addr_v6())
                    .map(|addr| (n.id, addr))
            })
            .collect())
    }

    async fn get_prefix(
        &self,
        key: &str,
    ) -> Result<IpPrefix> {
        let bytes = self.db.get_value(key).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidArgument(format!("{} is not utf-8: {}", key, e)))?;
        text.parse()
    }
}
