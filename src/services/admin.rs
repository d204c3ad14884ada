//! Network ACL administration.

use std::sync::Arc;

use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::context::effective_caller;
use super::Action;
use super::GetNetworkAclRequest;
use super::RbacEvaluator;
use super::Resource;
use super::Verb;
use crate::consensus::Consensus;
use crate::meshdb::MeshDb;
use crate::meshdb::NetworkAcl;
use crate::utils::id::is_valid_id;

pub struct AdminService {
    consensus: Arc<dyn Consensus>,
    db: MeshDb,
    rbac: Arc<dyn RbacEvaluator>,
}

impl AdminService {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        db: MeshDb,
        rbac: Arc<dyn RbacEvaluator>,
    ) -> Self {
        Self { consensus, db, rbac }
    }

    #[instrument(skip(self, request), fields(name = %request.get_ref().name))]
    pub async fn put_network_acl(
        &self,
        request: Request<NetworkAcl>,
    ) -> std::result::Result<Response<()>, Status> {
        if !self.consensus.is_leader() {
            return Err(Status::failed_precondition("not the leader"));
        }
        let acl = request.get_ref();
        if acl.name.is_empty() {
            return Err(Status::invalid_argument("acl name is required"));
        }
        if !is_valid_id(&acl.name) {
            return Err(Status::invalid_argument("acl name must be a valid ID"));
        }
        let action = Action::new(Resource::NetworkAcls, Verb::Put, acl.name.as_str());
        if !self.rbac.evaluate(effective_caller(&request), &action) {
            warn!("[rpc|put_network_acl] denied {}", action);
            return Err(Status::permission_denied(
                "caller does not have permission to put network acls",
            ));
        }
        if !acl.has_match_set() {
            return Err(Status::invalid_argument(
                "at least one of destination_cidrs, source_cidrs, source_nodes, or destination_nodes must be set",
            ));
        }
        acl.validate().map_err(Status::from)?;

        self.db
            .networking()
            .put_network_acl(acl)
            .await
            .map_err(Status::from)?;
        info!("stored network acl {}", acl.name);
        Ok(Response::new(()))
    }

    /// Local read; may lag behind the leader on a follower
    pub async fn get_network_acl(
        &self,
        request: Request<GetNetworkAclRequest>,
    ) -> std::result::Result<Response<NetworkAcl>, Status> {
        let name = &request.get_ref().name;
        if name.is_empty() {
            return Err(Status::invalid_argument("acl name is required"));
        }
        let acl = self
            .db
            .networking()
            .get_network_acl(name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(acl))
    }
}
