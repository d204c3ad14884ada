use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::DashSet;
#[cfg(test)]
use mockall::automock;
use tonic::async_trait;
use tracing::trace;

use crate::consensus::AppendEntriesRequest;
use crate::consensus::AppendEntriesResponse;
use crate::consensus::InstallSnapshotRequest;
use crate::consensus::InstallSnapshotResponse;
use crate::consensus::NodeId;
use crate::consensus::VoteRequest;
use crate::consensus::VoteResponse;
use crate::NetworkError;
use crate::Result;

/// Outbound peer RPCs of one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn request_vote(
        &self,
        target: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Inbound side of the peer RPCs
#[async_trait]
pub trait RaftHandler: Send + Sync + 'static {
    async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn handle_request_vote(
        &self,
        req: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Registry of in-process nodes. Isolated nodes can neither send nor
/// receive.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeId, Weak<dyn RaftHandler>>,
    isolated: DashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        id: &str,
        handler: Weak<dyn RaftHandler>,
    ) {
        self.nodes.insert(id.to_string(), handler);
    }

    pub fn deregister(
        &self,
        id: &str,
    ) {
        self.nodes.remove(id);
    }

    pub fn isolate(
        &self,
        id: &str,
    ) {
        self.isolated.insert(id.to_string());
    }

    pub fn restore(
        &self,
        id: &str,
    ) {
        self.isolated.remove(id);
    }

    /// Transport bound to `local_id` as the sender
    pub fn transport(
        self: &Arc<Self>,
        local_id: &str,
    ) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            local_id: local_id.to_string(),
        }
    }

    fn route(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Arc<dyn RaftHandler>> {
        if self.isolated.contains(from) || self.isolated.contains(to) {
            return Err(NetworkError::Unreachable {
                node_id: to.to_string(),
            }
            .into());
        }
        self.nodes
            .get(to)
            .and_then(|h| h.upgrade())
            .ok_or_else(|| {
                NetworkError::Unreachable {
                    node_id: to.to_string(),
                }
                .into()
            })
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local_id: NodeId,
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        trace!(from = %self.local_id, to = target, "append_entries");
        let handler = self.network.route(&self.local_id, target)?;
        handler.handle_append_entries(req).await
    }

    async fn request_vote(
        &self,
        target: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        trace!(from = %self.local_id, to = target, "request_vote");
        let handler = self.network.route(&self.local_id, target)?;
        handler.handle_request_vote(req).await
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        trace!(from = %self.local_id, to = target, "install_snapshot");
        let handler = self.network.route(&self.local_id, target)?;
        handler.handle_install_snapshot(req).await
    }
}
