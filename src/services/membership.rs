//! Join and Leave workflows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::context::effective_caller;
use super::context::is_in_network;
use super::JoinRequest;
use super::JoinResponse;
use super::LeaveRequest;
use super::LeaveResponse;
use super::RbacEvaluator;
use crate::consensus::Consensus;
use crate::consensus::Server;
use crate::meshdb::MeshDb;
use crate::meshdb::MeshNode;
use crate::plugins::AllocateIpRequest;
use crate::plugins::Event;
use crate::plugins::EventType;
use crate::plugins::IpVersion;
use crate::plugins::PluginManager;
use crate::utils::id::is_valid_id;
use crate::utils::net::IpPrefix;
use crate::utils::time::get_now_as_u64_millis;
use crate::ConsensusError;
use crate::Error;

pub struct MembershipService {
    node_id: String,
    consensus: Arc<dyn Consensus>,
    db: MeshDb,
    plugins: Arc<PluginManager>,
    rbac: Arc<dyn RbacEvaluator>,
    apply_timeout: Duration,
    barrier_timeout: Duration,
    /// Serializes Join and Leave so address allocation and peer writes do
    /// not interleave
    lock: Mutex<()>,
}

impl MembershipService {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        db: MeshDb,
        plugins: Arc<PluginManager>,
        rbac: Arc<dyn RbacEvaluator>,
        apply_timeout: Duration,
        barrier_timeout: Duration,
    ) -> Self {
        Self {
            node_id: consensus.id(),
            consensus,
            db,
            plugins,
            rbac,
            apply_timeout,
            barrier_timeout,
            lock: Mutex::new(()),
        }
    }

    #[instrument(skip(self, request), fields(id = %request.get_ref().id))]
    pub async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status> {
        let req = request.get_ref();
        if !is_valid_id(&req.id) {
            return Err(Status::invalid_argument(format!("invalid node id {:?}", req.id)));
        }
        if req.public_key.is_empty() {
            return Err(Status::invalid_argument("public key is required"));
        }
        if !self.consensus.is_leader() {
            return Err(Status::failed_precondition("not leader"));
        }
        if self.rbac.is_secure() {
            check_identity(effective_caller(&request), &req.id)?;
        }

        let _guard = self.lock.lock().await;
        info!("join request from {}", req.id);
        let peers = self.db.peers();
        let state = self.db.state();

        let existing = match peers.get(&req.id).await {
            Ok(node) => Some(node),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("lookup peer").into()),
        };
        let network_ipv4 = state
            .get_ipv4_prefix()
            .await
            .map_err(|e| Status::failed_precondition(format!("mesh ipv4 prefix unavailable: {}", e)))?;
        let network_ipv6 = match state.get_ipv6_prefix().await {
            Ok(prefix) => Some(prefix),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("read mesh ipv6 prefix").into()),
        };

        let mut private_ipv4 = existing.as_ref().and_then(|n| n.private_ipv4);
        if private_ipv4.is_none() && req.assign_ipv4 {
            private_ipv4 = Some(self.allocate(&req.id, network_ipv4, IpVersion::V4).await?);
        }
        let mut private_ipv6 = existing.as_ref().and_then(|n| n.private_ipv6);
        if let (None, Some(network)) = (private_ipv6, network_ipv6) {
            private_ipv6 = Some(self.allocate(&req.id, network, IpVersion::V6).await?);
        }

        let node = MeshNode {
            id: req.id.clone(),
            public_key: req.public_key.clone(),
            primary_endpoint: req.primary_endpoint.clone(),
            wireguard_endpoints: req.wireguard_endpoints.clone(),
            zone_awareness_id: req.zone_awareness_id.clone(),
            private_ipv4,
            private_ipv6,
            features: req.features.clone(),
            joined_at: existing
                .as_ref()
                .map(|n| n.joined_at)
                .unwrap_or_else(get_now_as_u64_millis),
        };
        let raft_member = if req.joins_consensus() {
            Some(raft_server(req, &node)?)
        } else {
            None
        };

        peers.put(&node).await.map_err(Status::from)?;

        if let Some(server) = raft_member {
            info!("adding {} to consensus as {:?}", server.id, server.suffrage);
            self.consensus
                .add_server(server, self.apply_timeout)
                .await
                .map_err(|e| e.context(format!("peer {} stored but not added to consensus", req.id)))?;
            if let Err(e) = self.consensus.barrier(self.barrier_timeout).await {
                warn!("barrier after adding {}: {}", req.id, e);
            }
        }

        self.notify(EventType::NodeJoin, node.clone());

        let others = peers
            .list()
            .await
            .map_err(Status::from)?
            .into_iter()
            .filter(|n| n.id != node.id)
            .collect();
        Ok(Response::new(JoinResponse {
            address_ipv4: node.private_ipv4,
            address_ipv6: node.private_ipv6,
            network_ipv4,
            network_ipv6,
            mesh_domain: state.get_mesh_domain().await.map_err(Status::from)?,
            peers: others,
        }))
    }

    /// Removes the caller from consensus, then deletes its peer record.
    #[instrument(skip(self, request), fields(id = %request.get_ref().id))]
    pub async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status> {
        if !is_in_network(&request) {
            warn!("[rpc|leave] request from outside the mesh");
            return Err(Status::permission_denied("request is not in-network"));
        }
        let id = request.get_ref().id.as_str();
        if id.is_empty() {
            return Err(Status::invalid_argument("id is required"));
        }
        if !self.consensus.is_leader() {
            return Err(Status::failed_precondition("not leader"));
        }

        let _guard = self.lock.lock().await;
        info!("leave request for {}", id);
        if self.rbac.is_secure() {
            check_identity(effective_caller(&request), id)?;
        }

        let peers = self.db.peers();
        let leaving = match peers.get(id).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                debug!("{} is not a peer, nothing to do", id);
                return Ok(Response::new(LeaveResponse {}));
            }
            Err(e) => return Err(e.context("lookup peer").into()),
        };
        if id == self.node_id {
            self.leave_self(id).await?;
        } else {
            self.remove_peer(id).await?;
        }

        self.notify(EventType::NodeLeave, leaving);
        Ok(Response::new(LeaveResponse {}))
    }

    /// Drops `id` from consensus if it is a member, then deletes its record.
    async fn remove_peer(
        &self,
        id: &str,
    ) -> std::result::Result<(), Status> {
        if self.consensus.membership().contains(id) {
            info!("removing {} from consensus", id);
            match self.consensus.remove_server(id, self.apply_timeout).await {
                Ok(()) | Err(Error::Consensus(ConsensusError::UnknownServer(_))) => {}
                Err(e) => return Err(e.context(format!("remove {} from consensus", id)).into()),
            }
            if let Err(e) = self.consensus.barrier(self.barrier_timeout).await {
                warn!("barrier after removing {}: {}", id, e);
            }
        }

        info!("deleting peer record {}", id);
        self.db
            .peers()
            .delete(id)
            .await
            .map_err(|e| e.context(format!("{} removed from consensus but peer record remains", id)))?;
        Ok(())
    }

    /// The leader leaving itself. It steps down once its removal commits, so
    /// the record is deleted while it can still write.
    async fn leave_self(
        &self,
        id: &str,
    ) -> std::result::Result<(), Status> {
        let membership = self.consensus.membership();
        if membership.is_voter(id) && membership.voter_count() == 1 {
            return Err(Status::failed_precondition("the last voter cannot leave the mesh"));
        }

        info!("deleting own peer record {}", id);
        self.db.peers().delete(id).await.map_err(|e| e.context("delete own peer record"))?;

        if membership.contains(id) {
            info!("leader {} removing itself from consensus", id);
            match self.consensus.remove_server(id, self.apply_timeout).await {
                Ok(()) | Err(Error::Consensus(ConsensusError::UnknownServer(_))) => {}
                Err(e) => {
                    return Err(e
                        .context(format!("peer record of {} deleted but it is still in consensus", id))
                        .into())
                }
            }
        }
        Ok(())
    }

    async fn allocate(
        &self,
        node_id: &str,
        subnet: IpPrefix,
        version: IpVersion,
    ) -> std::result::Result<IpPrefix, Status> {
        self.plugins
            .allocate_ip(AllocateIpRequest {
                node_id: node_id.to_string(),
                subnet,
                version,
            })
            .await
            .map_err(|e| {
                warn!("allocate {:?} address for {}: {}", version, node_id, e);
                Status::from(e)
            })
    }

    /// Queues a plugin event. Failures only reach the log.
    fn notify(
        &self,
        kind: EventType,
        node: MeshNode,
    ) {
        if !self.plugins.has_watchers() {
            return;
        }
        if let Err(e) = self.plugins.emit(Event { kind, node }) {
            warn!("emit {:?} event: {}", kind, e);
        }
    }
}

fn check_identity(
    caller: Option<&str>,
    id: &str,
) -> std::result::Result<(), Status> {
    match caller {
        Some(caller) if caller == id => Ok(()),
        Some(caller) => Err(Status::permission_denied(format!(
            "caller {} may not act for {}",
            caller, id
        ))),
        None => Err(Status::permission_denied("no peer authentication info in request")),
    }
}

/// Consensus membership entry for a joining node
fn raft_server(
    req: &JoinRequest,
    node: &MeshNode,
) -> std::result::Result<Server, Status> {
    let address = match &req.raft_address {
        Some(address) if !address.is_empty() => address.clone(),
        _ => {
            let derived = if req.prefer_raft_ipv6 {
                node.private_rpc_addr_v6().or_else(|| node.private_rpc_addr_v4())
            } else {
                node.private_rpc_addr_v4().or_else(|| node.private_rpc_addr_v6())
            };
            derived
                .ok_or_else(|| {
                    Status::invalid_argument(
                        "raft address required: no private address with a nodes port",
                    )
                })?
                .to_string()
        }
    };
    Ok(if req.as_voter {
        Server::voter(&req.id, address)
    } else {
        Server::non_voter(&req.id, address)
    })
}
