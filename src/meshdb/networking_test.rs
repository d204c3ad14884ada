use super::*;
use crate::test_utils::mem_mesh_storage;

fn acl(name: &str) -> NetworkAcl {
    let mut acl = NetworkAcl::new(name, AclAction::Accept);
    acl.source_nodes = vec!["*".into()];
    acl
}

#[test]
fn validate_should_require_a_match_set() {
    let acl = NetworkAcl::new("empty", AclAction::Deny);
    let err = acl.validate().unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[test]
fn validate_should_accept_any_single_match_set() {
    let mut a = NetworkAcl::new("a", AclAction::Accept);
    a.destination_cidrs = vec!["10.0.0.0/8".into()];
    a.validate().unwrap();

    let mut b = NetworkAcl::new("b", AclAction::Accept);
    b.source_cidrs = vec!["fd00::/48".into()];
    b.validate().unwrap();

    let mut c = NetworkAcl::new("c", AclAction::Deny);
    c.destination_nodes = vec!["node-1".into()];
    c.validate().unwrap();
}

#[test]
fn validate_should_reject_bad_fields() {
    assert!(acl("has space").validate().is_err());

    let mut bad_cidr = NetworkAcl::new("x", AclAction::Accept);
    bad_cidr.source_cidrs = vec!["10.0.0.0/33".into()];
    assert!(bad_cidr.validate().is_err());

    let mut bad_node = NetworkAcl::new("x", AclAction::Accept);
    bad_node.destination_nodes = vec!["no/slashes".into()];
    assert!(bad_node.validate().is_err());

    assert!(acl("").validate().is_err());
}

#[test]
fn action_should_serialize_lowercase() {
    let json = serde_json::to_value(acl("x")).unwrap();
    assert_eq!(json["action"], "accept");
    assert!(json.get("destination_cidrs").is_none());
}

#[tokio::test]
async fn put_then_get_should_roundtrip() {
    let networking = Networking::new(mem_mesh_storage());
    let mut rule = acl("allow-all");
    rule.priority = 7;
    rule.destination_cidrs = vec!["172.16.0.0/12".into()];

    networking.put_network_acl(&rule).await.unwrap();
    assert_eq!(networking.get_network_acl("allow-all").await.unwrap(), rule);
}

#[tokio::test]
async fn put_invalid_acl_should_not_write() {
    let networking = Networking::new(mem_mesh_storage());
    let err = networking
        .put_network_acl(&NetworkAcl::new("empty", AclAction::Deny))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert!(networking.get_network_acl("empty").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_should_order_by_priority_and_delete_should_remove() {
    let networking = Networking::new(mem_mesh_storage());
    for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
        let mut rule = acl(name);
        rule.priority = priority;
        networking.put_network_acl(&rule).await.unwrap();
    }

    let names: Vec<String> = networking
        .list_network_acls()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["high", "mid", "low"]);

    networking.delete_network_acl("mid").await.unwrap();
    assert_eq!(networking.list_network_acls().await.unwrap().len(), 2);
    assert!(networking.get_network_acl("mid").await.unwrap_err().is_not_found());
}
