use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tonic::async_trait;
use tonic::Code;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing_test::traced_test;

use super::context::authenticated_caller;
use super::context::effective_caller;
use super::context::forwarded_request;
use super::context::is_in_network;
use super::context::peer_request;
use super::context::proxied_for;
use super::*;
use crate::consensus::MockConsensus;
use crate::meshdb::AclAction;
use crate::meshdb::MeshNode;
use crate::meshdb::NetworkAcl;
use crate::metrics::PROXIED_REQUESTS;
use crate::test_utils::follower_consensus;
use crate::test_utils::MeshFixture;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// What the leader saw of a forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    caller: Option<String>,
    proxied_for: Option<String>,
    effective: Option<String>,
    in_network: bool,
}

impl Seen {
    fn of<T>(request: &Request<T>) -> Self {
        Self {
            caller: authenticated_caller(request).map(str::to_string),
            proxied_for: proxied_for(request).map(str::to_string),
            effective: effective_caller(request).map(str::to_string),
            in_network: is_in_network(request),
        }
    }
}

fn untouched_inner() -> MockMeshApi {
    let mut inner = MockMeshApi::new();
    inner.expect_join().never();
    inner.expect_leave().never();
    inner.expect_put_network_acl().never();
    inner
}

/// Leader that records what it received on `leave`
fn recording_leader(seen: Arc<Mutex<Vec<Seen>>>) -> Arc<dyn MeshApi> {
    let mut leader = MockMeshApi::new();
    leader.expect_leave().returning(move |request| {
        seen.lock().push(Seen::of(&request));
        Ok(Response::new(LeaveResponse {}))
    });
    Arc::new(leader)
}

fn dialer_to(leader: Arc<dyn MeshApi>) -> Arc<dyn LeaderDialer> {
    let mut dialer = MockLeaderDialer::new();
    dialer.expect_dial().returning(move |server| {
        assert_eq!(server.id, "l1");
        Ok(leader.clone())
    });
    Arc::new(dialer)
}

fn never_dialed() -> Arc<dyn LeaderDialer> {
    let mut dialer = MockLeaderDialer::new();
    dialer.expect_dial().never();
    Arc::new(dialer)
}

fn leave(
    caller: &str,
    id: &str,
) -> Request<LeaveRequest> {
    peer_request(caller, LeaveRequest { id: id.to_string() })
}

#[tokio::test]
#[traced_test]
async fn leader_should_serve_writes_itself() {
    let mut consensus = MockConsensus::new();
    consensus.expect_is_leader().return_const(true);
    let mut inner = MockMeshApi::new();
    inner
        .expect_leave()
        .times(1)
        .returning(|_| Ok(Response::new(LeaveResponse {})));
    let proxy = LeaderProxy::new(inner, Arc::new(consensus), never_dialed(), true, FORWARD_TIMEOUT);

    proxy.leave(leave("n1", "n1")).await.unwrap();
}

/// # Case: follower forwards a write
///
/// ## Validation criteria
/// 1. the leader sees the follower as caller, in-network
/// 2. proxied-for carries the original caller, who is the effective caller
/// 3. the forwarded-requests counter moves
#[tokio::test]
#[traced_test]
async fn follower_should_forward_writes_with_the_original_identity() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some("l1"))),
        dialer_to(recording_leader(seen.clone())),
        true,
        FORWARD_TIMEOUT,
    );
    let before = PROXIED_REQUESTS.with_label_values(&["leave"]).get();

    proxy.leave(leave("n1", "n1")).await.unwrap();

    assert_eq!(
        seen.lock().clone(),
        vec![Seen {
            caller: Some("f1".to_string()),
            proxied_for: Some("n1".to_string()),
            effective: Some("n1".to_string()),
            in_network: true,
        }]
    );
    assert!(PROXIED_REQUESTS.with_label_values(&["leave"]).get() > before);
}

#[tokio::test]
#[traced_test]
async fn anonymous_callers_should_be_forwarded_as_anonymous() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some("l1"))),
        dialer_to(recording_leader(seen.clone())),
        true,
        FORWARD_TIMEOUT,
    );

    proxy
        .leave(Request::new(LeaveRequest { id: "n1".to_string() }))
        .await
        .unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen[0].proxied_for.as_deref(), Some(""));
    assert_eq!(seen[0].effective, None);
}

#[tokio::test]
#[traced_test]
async fn follower_should_return_the_leader_error_unchanged() {
    let mut leader = MockMeshApi::new();
    leader
        .expect_put_network_acl()
        .returning(|_| Err(Status::permission_denied("caller does not have permission")));
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some("l1"))),
        dialer_to(Arc::new(leader)),
        true,
        FORWARD_TIMEOUT,
    );
    let mut acl = NetworkAcl::new("acl", AclAction::Deny);
    acl.source_nodes = vec!["*".to_string()];

    let status = proxy.put_network_acl(peer_request("n1", acl)).await.unwrap_err();

    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "caller does not have permission");
}

#[tokio::test]
#[traced_test]
async fn proxied_requests_should_not_be_forwarded_again() {
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f2", Some("l1"))),
        never_dialed(),
        true,
        FORWARD_TIMEOUT,
    );

    let request = forwarded_request("f1", leave("n1", "n1"));
    let status = proxy.leave(request).await.unwrap_err();

    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
#[traced_test]
async fn follower_without_a_leader_should_fail_fast() {
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", None)),
        never_dialed(),
        true,
        FORWARD_TIMEOUT,
    );

    let status = proxy.join(peer_request("n1", JoinRequest::new("n1", "key"))).await.unwrap_err();

    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("no leader"));
}

#[tokio::test]
#[traced_test]
async fn disabled_proxy_should_hand_writes_to_the_local_service() {
    let mut inner = MockMeshApi::new();
    inner
        .expect_leave()
        .times(1)
        .returning(|_| Err(Status::failed_precondition("not leader")));
    let proxy = LeaderProxy::new(
        inner,
        Arc::new(follower_consensus("f1", Some("l1"))),
        never_dialed(),
        false,
        FORWARD_TIMEOUT,
    );

    let status = proxy.leave(leave("n1", "n1")).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
#[traced_test]
async fn reads_should_stay_local_on_followers() {
    let mut inner = MockMeshApi::new();
    inner
        .expect_get_node()
        .times(1)
        .returning(|request| Ok(Response::new(MeshNode::new(request.into_inner().id, "key"))));
    inner
        .expect_get_network_acl()
        .times(1)
        .returning(|_| Err(Status::not_found("network acl missing")));
    let proxy = LeaderProxy::new(
        inner,
        Arc::new(follower_consensus("f1", Some("l1"))),
        never_dialed(),
        true,
        FORWARD_TIMEOUT,
    );

    let node = proxy
        .get_node(Request::new(GetNodeRequest { id: "n1".to_string() }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(node.id, "n1");
    let status = proxy
        .get_network_acl(Request::new(GetNetworkAclRequest {
            name: "missing".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

/// Leader that never answers a leave
struct Stalled;

#[async_trait]
impl MeshApi for Stalled {
    async fn join(
        &self,
        _request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status> {
        Err(Status::unimplemented("join"))
    }

    async fn leave(
        &self,
        _request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Response::new(LeaveResponse {}))
    }

    async fn get_node(
        &self,
        _request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<MeshNode>, Status> {
        Err(Status::unimplemented("get_node"))
    }

    async fn put_network_acl(
        &self,
        _request: Request<NetworkAcl>,
    ) -> std::result::Result<Response<()>, Status> {
        Err(Status::unimplemented("put_network_acl"))
    }

    async fn get_network_acl(
        &self,
        _request: Request<GetNetworkAclRequest>,
    ) -> std::result::Result<Response<NetworkAcl>, Status> {
        Err(Status::unimplemented("get_network_acl"))
    }
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn forwarding_should_time_out() {
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some("l1"))),
        dialer_to(Arc::new(Stalled)),
        true,
        Duration::from_millis(200),
    );

    let status = proxy.leave(leave("n1", "n1")).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
}

#[tokio::test]
#[traced_test]
async fn unreachable_leader_should_surface_as_unavailable() {
    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some("l1"))),
        LocalDialer::new(),
        true,
        FORWARD_TIMEOUT,
    );

    let status = proxy.leave(leave("n1", "n1")).await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

/// # Case: follower to leader through the in-process dialer
///
/// ## Setup
/// 1. real leader services behind a [`LocalDialer`]
/// 2. a follower proxy that dials them
///
/// ## Validation criteria
/// 1. the follower's Join lands on the leader and allocates an address
#[tokio::test]
#[traced_test]
async fn local_dialer_should_reach_the_leader_services() {
    let fixture = MeshFixture::new("10.10.0.0/24", None).await;
    let rbac: Arc<dyn RbacEvaluator> = Arc::new(AllowAll);
    let leader: Arc<dyn MeshApi> = Arc::new(MeshServer {
        membership: fixture.membership(rbac.clone()),
        admin: fixture.admin(rbac),
        nodes: NodeService::new(fixture.db.clone()),
    });
    let dialer = LocalDialer::new();
    dialer.register(MeshFixture::LEADER, &leader);

    let proxy = LeaderProxy::new(
        untouched_inner(),
        Arc::new(follower_consensus("f1", Some(MeshFixture::LEADER))),
        dialer.clone(),
        true,
        FORWARD_TIMEOUT,
    );
    let mut request = JoinRequest::new("n1", "key");
    request.assign_ipv4 = true;
    let response = proxy.join(peer_request("n1", request)).await.unwrap().into_inner();

    assert_eq!(response.address_ipv4, Some("10.10.0.1/32".parse().unwrap()));
    assert!(fixture.db.peers().get("n1").await.is_ok());
    dialer.deregister(MeshFixture::LEADER);
    fixture.cluster.shutdown().await;
}
