//! A running mesh node: consensus, mesh database, plugins and the RPC
//! surface, as assembled by [`NodeBuilder`](super::NodeBuilder).

use std::net::SocketAddr;
use std::sync::Arc;

use rand::thread_rng;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::Settings;
use crate::consensus::Consensus;
use crate::consensus::LocalNetwork;
use crate::consensus::Raft;
use crate::meshdb::Feature;
use crate::meshdb::FeaturePort;
use crate::meshdb::MeshDb;
use crate::meshdb::MeshNode;
use crate::plugins::AllocateIpRequest;
use crate::plugins::IpVersion;
use crate::plugins::PluginManager;
use crate::services::LocalDialer;
use crate::services::MeshApi;
use crate::storage::StorageEngine;
use crate::utils::net::generate_ula;
use crate::utils::net::IpPrefix;
use crate::utils::time::get_now_as_u64_millis;
use crate::Result;

pub struct Node {
    pub(super) id: String,
    pub(super) settings: Arc<Settings>,
    pub(super) engine: Arc<dyn StorageEngine>,
    pub(super) raft: Raft,
    pub(super) db: MeshDb,
    pub(super) plugins: Arc<PluginManager>,
    pub(super) api: Arc<dyn MeshApi>,
    pub(super) network: Arc<LocalNetwork>,
    pub(super) dialer: Arc<LocalDialer>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn consensus(&self) -> &Raft {
        &self.raft
    }

    pub fn db(&self) -> &MeshDb {
        &self.db
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// RPC surface behind the leader proxy
    pub fn api(&self) -> Arc<dyn MeshApi> {
        self.api.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Starts a new mesh with this node as its only voter.
    ///
    /// On a fresh store the node campaigns, then writes the mesh prefixes,
    /// the domain and its own peer record. A sole voter whose earlier
    /// bootstrap stopped halfway fills in whatever is missing. Returns false
    /// without touching anything when the mesh is already seeded or the node
    /// belongs to a larger cluster.
    #[instrument(skip(self), fields(node_id = %self.id))]
    pub async fn bootstrap(&self) -> Result<bool> {
        if !self.raft.bootstrap()? {
            let membership = self.raft.membership();
            if !(membership.is_voter(&self.id) && membership.voter_count() == 1) {
                info!("cluster state found, not bootstrapping");
                return Ok(false);
            }
            if self.is_seeded().await? {
                info!("mesh already bootstrapped");
                return Ok(false);
            }
            warn!("resuming an interrupted bootstrap");
        }
        if !self.raft.is_leader() {
            self.raft.campaign().await?;
        }
        self.seed().await?;
        Ok(true)
    }

    async fn is_seeded(&self) -> Result<bool> {
        let state = self.db.state();
        Ok(present(state.get_ipv4_prefix().await)?.is_some()
            && present(state.get_ipv6_prefix().await)?.is_some()
            && present(state.get_mesh_domain().await)?.is_some()
            && present(self.db.peers().get(&self.id).await)?.is_some())
    }

    /// Writes every mesh-wide setting and the own peer record that the
    /// store does not hold yet.
    async fn seed(&self) -> Result<()> {
        let mesh = &self.settings.mesh;
        let state = self.db.state();

        let ipv4_prefix = match present(state.get_ipv4_prefix().await)? {
            Some(prefix) => prefix,
            None => {
                let prefix = mesh.ipv4_prefix()?;
                state.set_ipv4_prefix(&prefix).await?;
                prefix
            }
        };
        let ipv6_prefix = match present(state.get_ipv6_prefix().await)? {
            Some(prefix) => prefix,
            None => {
                let prefix = match mesh.ipv6_prefix()? {
                    Some(prefix) => prefix,
                    None => {
                        let prefix = generate_ula(&mut thread_rng());
                        info!("generated ipv6 prefix {}", prefix);
                        prefix
                    }
                };
                state.set_ipv6_prefix(&prefix).await?;
                prefix
            }
        };
        if present(state.get_mesh_domain().await)?.is_none() {
            state.set_mesh_domain(&mesh.domain).await?;
        }

        let peers = self.db.peers();
        if present(peers.get(&self.id).await)?.is_some() {
            return Ok(());
        }
        let mut node = MeshNode::new(self.id.as_str(), self.settings.node.public_key.as_str());
        if let Ok(addr) = self.settings.node.advertise_address.parse::<SocketAddr>() {
            node.primary_endpoint = Some(addr.ip().to_string());
            node.features.push(FeaturePort {
                feature: Feature::Nodes,
                port: addr.port(),
            });
        }
        node.private_ipv4 = Some(self.allocate(ipv4_prefix, IpVersion::V4).await?);
        node.private_ipv6 = Some(self.allocate(ipv6_prefix, IpVersion::V6).await?);
        node.joined_at = get_now_as_u64_millis();
        peers.put(&node).await?;

        info!(
            ipv4 = ?node.private_ipv4,
            ipv6 = ?node.private_ipv6,
            "bootstrapped mesh {}",
            mesh.domain
        );
        Ok(())
    }

    async fn allocate(
        &self,
        subnet: IpPrefix,
        version: IpVersion,
    ) -> Result<IpPrefix> {
        self.plugins
            .allocate_ip(AllocateIpRequest {
                node_id: self.id.clone(),
                subnet,
                version,
            })
            .await
    }

    /// Detaches the node from the in-process network, closes every plugin
    /// and stops consensus. Returns the first failure.
    #[instrument(skip(self), fields(node_id = %self.id))]
    pub async fn shutdown(&self) -> Result<()> {
        self.dialer.deregister(&self.id);
        self.network.deregister(&self.id);

        let plugins = self.plugins.close().await;
        if let Err(e) = &plugins {
            error!("closing plugins: {}", e);
        }
        let consensus = self.raft.shutdown().await;
        if let Err(e) = &consensus {
            error!("stopping consensus: {}", e);
        }
        let engine = self.engine.flush();
        info!("node stopped");
        plugins.and(consensus).and(engine)
    }
}

/// `None` for a missing key, the value otherwise
fn present<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
