use std::collections::HashSet;

use meshnode::consensus::Consensus;
use meshnode::meshdb::AclAction;
use meshnode::meshdb::NetworkAcl;
use meshnode::services::context::peer_request;
use meshnode::services::GetNetworkAclRequest;
use meshnode::services::GetNodeRequest;
use meshnode::services::JoinRequest;
use meshnode::services::MeshApi;
use tonic::Code;
use tonic::Request;
use tracing_test::traced_test;

use crate::common::TestMesh;

#[tokio::test]
#[traced_test]
async fn voters_should_receive_distinct_addresses_and_replicated_records() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;

    let mut addresses = HashSet::new();
    for id in ["l", "f1", "f2"] {
        let record = mesh.leader().db().peers().get(id).await.unwrap();
        assert!(addresses.insert(record.private_ipv4.unwrap()));
    }
    for node in &mesh.nodes {
        assert_eq!(node.db().peers().list().await.unwrap().len(), 3);
    }
    assert_eq!(mesh.leader().consensus().membership().voters().count(), 3);
    mesh.shutdown().await;
}

/// # Case: a plain peer joins through a follower
///
/// ## Validation criteria
/// 1. the follower forwards the join to the leader
/// 2. the peer record is readable from every node
/// 3. the peer is not part of consensus
#[tokio::test]
#[traced_test]
async fn join_through_a_follower_should_be_forwarded_to_the_leader() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;

    let mut request = JoinRequest::new("n1", "n1-key");
    request.assign_ipv4 = true;
    let response = mesh
        .node("f1")
        .api()
        .join(peer_request("n1", request))
        .await
        .unwrap()
        .into_inner();
    assert!(response.address_ipv4.is_some());
    assert_eq!(response.peers.len(), 3);

    mesh.wait_caught_up().await;
    for node in &mesh.nodes {
        let record = node
            .api()
            .get_node(Request::new(GetNodeRequest { id: "n1".to_string() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(record.private_ipv4, response.address_ipv4);
    }
    assert!(!mesh.leader().consensus().membership().contains("n1"));
    mesh.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn acl_put_on_a_follower_should_be_authorized_as_the_original_caller() {
    let mesh = TestMesh::start(&["l", "f1", "f2"]).await;
    let mut acl = NetworkAcl::new("allow-all", AclAction::Accept);
    acl.source_nodes = vec!["*".to_string()];

    let status = mesh
        .node("f2")
        .api()
        .put_network_acl(peer_request("f2", acl.clone()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    mesh.node("f2")
        .api()
        .put_network_acl(peer_request("ops", acl.clone()))
        .await
        .unwrap();
    mesh.wait_caught_up().await;
    for node in &mesh.nodes {
        let stored = node
            .api()
            .get_network_acl(Request::new(GetNetworkAclRequest {
                name: "allow-all".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stored, acl);
    }
    mesh.shutdown().await;
}
