//! Forwarding of write RPCs from followers to the leader.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tonic::async_trait;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::warn;

use super::context::forwarded_request;
use super::context::is_proxied;
use super::GetNetworkAclRequest;
use super::GetNodeRequest;
use super::JoinRequest;
use super::JoinResponse;
use super::LeaderDialer;
use super::LeaveRequest;
use super::LeaveResponse;
use super::MeshApi;
use crate::consensus::Consensus;
use crate::meshdb::MeshNode;
use crate::meshdb::NetworkAcl;
use crate::metrics::PROXIED_REQUESTS;

/// Wraps a service so that writes reaching a follower are re-issued
/// against the leader. Reads always run locally.
pub struct LeaderProxy<S> {
    inner: S,
    consensus: Arc<dyn Consensus>,
    dialer: Arc<dyn LeaderDialer>,
    enabled: bool,
    forward_timeout: Duration,
}

impl<S: MeshApi> LeaderProxy<S> {
    pub fn new(
        inner: S,
        consensus: Arc<dyn Consensus>,
        dialer: Arc<dyn LeaderDialer>,
        enabled: bool,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            consensus,
            dialer,
            enabled,
            forward_timeout,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_forward(&self) -> bool {
        self.enabled && !self.consensus.is_leader()
    }

    async fn forward<T, R, F, Fut>(
        &self,
        method: &'static str,
        request: Request<T>,
        call: F,
    ) -> std::result::Result<Response<R>, Status>
    where
        T: Send,
        F: FnOnce(Arc<dyn MeshApi>, Request<T>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Response<R>, Status>> + Send,
    {
        if is_proxied(&request) {
            warn!("[rpc|{}] proxied request reached a non-leader", method);
            return Err(Status::failed_precondition(
                "request was already proxied and this node is not the leader",
            ));
        }
        let node_id = self.consensus.id();
        let leader = match self.consensus.leader() {
            Ok(leader) if leader.id != node_id => leader,
            _ => return Err(Status::failed_precondition("no leader is currently elected")),
        };
        debug!("[rpc|{}] forwarding to leader {}", method, leader.id);

        let client = self.dialer.dial(&leader).await.map_err(Status::from)?;
        let forwarded = forwarded_request(&node_id, request);
        PROXIED_REQUESTS.with_label_values(&[method]).inc();
        match tokio::time::timeout(self.forward_timeout, call(client, forwarded)).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded(format!(
                "forwarding {} to {} timed out after {:?}",
                method, leader.id, self.forward_timeout
            ))),
        }
    }
}

#[async_trait]
impl<S: MeshApi> MeshApi for LeaderProxy<S> {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status> {
        if !self.should_forward() {
            return self.inner.join(request).await;
        }
        self.forward("join", request, |client, req| async move { client.join(req).await })
            .await
    }

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status> {
        if !self.should_forward() {
            return self.inner.leave(request).await;
        }
        self.forward("leave", request, |client, req| async move { client.leave(req).await })
            .await
    }

    async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<MeshNode>, Status> {
        self.inner.get_node(request).await
    }

    async fn put_network_acl(
        &self,
        request: Request<NetworkAcl>,
    ) -> std::result::Result<Response<()>, Status> {
        if !self.should_forward() {
            return self.inner.put_network_acl(request).await;
        }
        self.forward("put_network_acl", request, |client, req| async move {
            client.put_network_acl(req).await
        })
        .await
    }

    async fn get_network_acl(
        &self,
        request: Request<GetNetworkAclRequest>,
    ) -> std::result::Result<Response<NetworkAcl>, Status> {
        self.inner.get_network_acl(request).await
    }
}
