use std::time::Duration;

use meshnode::consensus::Consensus;
use meshnode::node::Node;
use meshnode::services::context::peer_request;
use meshnode::services::GetNodeRequest;
use meshnode::services::JoinRequest;
use meshnode::services::LeaveRequest;
use meshnode::services::MeshApi;
use tonic::Code;
use tonic::Request;
use tracing_test::traced_test;

use crate::common::TestMesh;
use crate::common::WAIT_TIMEOUT;

fn get_node(id: &str) -> Request<GetNodeRequest> {
    Request::new(GetNodeRequest { id: id.to_string() })
}

fn leave(id: &str) -> LeaveRequest {
    LeaveRequest { id: id.to_string() }
}

/// Polls until `node` no longer serves the record of `id`
async fn wait_record_gone(
    node: &Node,
    id: &str,
) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        match node.api().get_node(get_node(id)).await {
            Err(status) if status.code() == Code::NotFound => return,
            _ => {
                assert!(tokio::time::Instant::now() < deadline, "{} still visible on {}", id, node.id());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// # Case: a peer leaves through a follower
///
/// ## Setup
/// 1. three voters l, f1, f2; l is the leader
/// 2. plain peer n1 joined through l
///
/// ## Validation criteria
/// 1. f1 forwards the Leave carrying n1 as the original caller
/// 2. once caught up, GetNode("n1") is NotFound on every node
#[tokio::test]
#[traced_test]
async fn leave_through_a_follower_should_remove_the_peer_everywhere() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;
    mesh.leader()
        .api()
        .join(peer_request("n1", JoinRequest::new("n1", "n1-key")))
        .await
        .unwrap();
    mesh.wait_caught_up().await;
    for node in &mesh.nodes {
        node.api().get_node(get_node("n1")).await.unwrap();
    }

    mesh.node("f1")
        .api()
        .leave(peer_request("n1", leave("n1")))
        .await
        .unwrap();

    mesh.wait_caught_up().await;
    for node in &mesh.nodes {
        let status = node.api().get_node(get_node("n1")).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound, "node {}", node.id());
    }
    mesh.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn leave_on_behalf_of_another_peer_should_be_denied() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;

    let status = mesh
        .node("f1")
        .api()
        .leave(peer_request("f1", leave("f2")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
    mesh.leader().api().get_node(get_node("f2")).await.unwrap();
    mesh.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn voter_leaving_itself_should_drop_out_of_consensus() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;

    mesh.node("f2")
        .api()
        .leave(peer_request("f2", leave("f2")))
        .await
        .unwrap();

    assert!(!mesh.leader().consensus().membership().contains("f2"));
    mesh.wait_caught_up().await;
    for id in ["l", "f1"] {
        let status = mesh.node(id).api().get_node(get_node("f2")).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
    mesh.shutdown().await;
}

/// # Case: the leader leaves the mesh
///
/// ## Validation criteria
/// 1. the call succeeds and the old leader steps down
/// 2. the remaining voters form the configuration
/// 3. its record disappears from the other nodes
#[tokio::test]
#[traced_test]
async fn leader_leaving_itself_should_step_down() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;

    mesh.leader()
        .api()
        .leave(peer_request("l", leave("l")))
        .await
        .unwrap();

    assert!(!mesh.leader().is_leader());
    let members = mesh.leader().consensus().membership();
    assert!(!members.contains("l"));
    assert_eq!(members.voter_count(), 2);
    for id in ["f1", "f2"] {
        wait_record_gone(mesh.node(id), "l").await;
    }
    mesh.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn forwarding_should_fail_once_the_leader_is_gone() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;
    mesh.leader().shutdown().await.unwrap();

    let status = mesh
        .node("f1")
        .api()
        .join(peer_request("n1", JoinRequest::new("n1", "n1-key")))
        .await
        .unwrap_err();
    assert!(
        matches!(status.code(), Code::Unavailable | Code::FailedPrecondition),
        "unexpected status {:?}",
        status
    );
    for id in ["f1", "f2"] {
        mesh.node(id).shutdown().await.unwrap();
    }
}
