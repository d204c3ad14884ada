use tonic::Request;
use tonic::Response;
use tonic::Status;

use super::GetNodeRequest;
use crate::meshdb::MeshDb;
use crate::meshdb::MeshNode;

/// Peer lookups served from the local replica
pub struct NodeService {
    db: MeshDb,
}

impl NodeService {
    pub fn new(db: MeshDb) -> Self {
        Self { db }
    }

    pub async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<MeshNode>, Status> {
        let id = &request.get_ref().id;
        if id.is_empty() {
            return Err(Status::invalid_argument("id is required"));
        }
        let node = self.db.peers().get(id).await.map_err(Status::from)?;
        Ok(Response::new(node))
    }
}
