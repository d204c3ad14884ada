use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::decode;
use super::encode;
use crate::constants::PEERS_PREFIX;
use crate::storage::MeshStorage;
use crate::utils::id::is_valid_id;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::Result;

/// Services a node may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Node RPC surface (GetNode, Join, Leave)
    Nodes,
    LeaderProxy,
    Membership,
    AdminApi,
    MetricsServer,
    StorageQuerier,
}

impl fmt::Display for Feature {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Feature::Nodes => "nodes",
            Feature::LeaderProxy => "leader-proxy",
            Feature::Membership => "membership",
            Feature::AdminApi => "admin-api",
            Feature::MetricsServer => "metrics-server",
            Feature::StorageQuerier => "storage-querier",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePort {
    pub feature: Feature,
    pub port: u16,
}

/// Peer record stored under `/registry/peers/<id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    pub id: String,
    pub public_key: String,
    /// Publicly reachable host, when the node has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wireguard_endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_awareness_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ipv4: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ipv6: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FeaturePort>,
    /// Unix millis of the first successful join
    pub joined_at: u64,
}

impl MeshNode {
    pub fn new(
        id: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            public_key: public_key.into(),
            primary_endpoint: None,
            wireguard_endpoints: Vec::new(),
            zone_awareness_id: None,
            private_ipv4: None,
            private_ipv6: None,
            features: Vec::new(),
            joined_at: 0,
        }
    }

    pub fn port_for(
        &self,
        feature: Feature,
    ) -> Option<u16> {
        self.features.iter().find(|f| f.feature == feature).map(|f| f.port)
    }

    pub fn has_feature(
        &self,
        feature: Feature,
    ) -> bool {
        self.port_for(feature).is_some()
    }

    /// Primary endpoint plus the node RPC port
    pub fn public_rpc_addr(&self) -> Option<SocketAddr> {
        let port = self.port_for(Feature::Nodes)?;
        let host: IpAddr = self.primary_endpoint.as_deref()?.parse().ok()?;
        Some(SocketAddr::new(host, port))
    }

    pub fn private_rpc_addr_v4(&self) -> Option<SocketAddr> {
        let port = self.port_for(Feature::Nodes)?;
        Some(SocketAddr::new(self.private_ipv4?.addr(), port))
    }

    pub fn private_rpc_addr_v6(&self) -> Option<SocketAddr> {
        let port = self.port_for(Feature::Nodes)?;
        Some(SocketAddr::new(self.private_ipv6?.addr(), port))
    }
}

/// Peer records
#[derive(Clone)]
pub struct Peers {
    db: Arc<dyn MeshStorage>,
}

impl Peers {
    pub fn new(db: Arc<dyn MeshStorage>) -> Self {
        Self { db }
    }

    /// # Errors
    /// `Error::NotFound` for an unknown id
    pub async fn get(
        &self,
        id: &str,
    ) -> Result<MeshNode> {
        match self.db.get_value(&peer_key(id)).await {
            Ok(bytes) => decode(&bytes),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("node {}", id))),
            Err(e) => Err(e),
        }
    }

    /// Creates or replaces a peer.
    ///
    /// # Errors
    /// `Error::InvalidArgument` when the id is malformed or an address is
    /// already held by another peer
    pub async fn put(
        &self,
        node: &MeshNode,
    ) -> Result<()> {
        if !is_valid_id(&node.id) {
            return Err(Error::InvalidArgument(format!("invalid node id {:?}", node.id)));
        }
        if node.private_ipv4.is_some() || node.private_ipv6.is_some() {
            for other in self.list().await? {
                if other.id == node.id {
                    continue;
                }
                if node.private_ipv4.is_some() && other.private_ipv4 == node.private_ipv4 {
                    return Err(Error::InvalidArgument(format!(
                        "ipv4 address {:?} already assigned to {}",
                        node.private_ipv4, other.id
                    )));
                }
                if node.private_ipv6.is_some() && other.private_ipv6 == node.private_ipv6 {
                    return Err(Error::InvalidArgument(format!(
                        "ipv6 address {:?} already assigned to {}",
                        node.private_ipv6, other.id
                    )));
                }
            }
        }
        debug!("put peer {}", node.id);
        self.db.put_value(&peer_key(&node.id), encode(node)?).await
    }

    /// Removing an unknown peer succeeds
    pub async fn delete(
        &self,
        id: &str,
    ) -> Result<()> {
        self.db.delete(&peer_key(id)).await
    }

    pub async fn list(&self) -> Result<Vec<MeshNode>> {
        let mut nodes: Vec<MeshNode> = Vec::new();
        self.db
            .iter_prefix(PEERS_PREFIX, &mut |_, value| {
                nodes.push(decode(value)?);
                Ok(())
            })
            .await?;
        Ok(nodes)
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .list(PEERS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(PEERS_PREFIX).map(str::to_string))
            .collect())
    }

    /// Peers with a primary endpoint
    pub async fn list_public_nodes(&self) -> Result<Vec<MeshNode>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.primary_endpoint.is_some())
            .collect())
    }
}

fn peer_key(id: &str) -> String {
    format!("{}{}", PEERS_PREFIX, id)
}
