//! RPC surface of a mesh node.
//!
//! Handlers speak `tonic` request/response types so identity, metadata and
//! status codes survive unchanged whether a call is served locally or
//! forwarded to the leader by [`LeaderProxy`].

pub mod context;
mod admin;
mod dialer;
mod leader_proxy;
mod membership;
mod nodes;
mod rbac;
mod types;

pub use admin::*;
pub use dialer::*;
pub use leader_proxy::*;
pub use membership::*;
pub use nodes::*;
pub use rbac::*;
pub use types::*;

#[cfg(test)]
mod leader_proxy_test;

#[cfg(test)]
use mockall::automock;
use tonic::async_trait;
use tonic::Request;
use tonic::Response;
use tonic::Status;

use crate::meshdb::MeshNode;
use crate::meshdb::NetworkAcl;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshApi: Send + Sync + 'static {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status>;

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status>;

    async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<MeshNode>, Status>;

    async fn put_network_acl(
        &self,
        request: Request<NetworkAcl>,
    ) -> std::result::Result<Response<()>, Status>;

    async fn get_network_acl(
        &self,
        request: Request<GetNetworkAclRequest>,
    ) -> std::result::Result<Response<NetworkAcl>, Status>;
}

/// Every service of one node behind a single [`MeshApi`]
pub struct MeshServer {
    pub membership: MembershipService,
    pub admin: AdminService,
    pub nodes: NodeService,
}

#[async_trait]
impl MeshApi for MeshServer {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status> {
        self.membership.join(request).await
    }

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status> {
        self.membership.leave(request).await
    }

    async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<MeshNode>, Status> {
        self.nodes.get_node(request).await
    }

    async fn put_network_acl(
        &self,
        request: Request<NetworkAcl>,
    ) -> std::result::Result<Response<()>, Status> {
        self.admin.put_network_acl(request).await
    }

    async fn get_network_acl(
        &self,
        request: Request<GetNetworkAclRequest>,
    ) -> std::result::Result<Response<NetworkAcl>, Status> {
        self.admin.get_network_acl(request).await
    }
}
