use std::collections::HashMap;

use super::*;

fn grants(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(caller, rules)| (caller.to_string(), rules.iter().map(|r| r.to_string()).collect()))
        .collect()
}

fn put_acl(name: &str) -> Action {
    Action::new(Resource::NetworkAcls, Verb::Put, name)
}

#[test]
fn allow_all_should_permit_anonymous_callers() {
    assert!(!AllowAll.is_secure());
    assert!(AllowAll.evaluate(None, &put_acl("any")));
}

#[test]
fn static_rbac_should_match_exact_and_wildcard_segments() {
    let rbac = StaticRbac::from_config(&grants(&[
        ("admin", &["*"][..]),
        ("ops", &["network-acls:put:allow-web", "peers:get:*"][..]),
        ("*", &["network-acls:get:*"][..]),
    ]))
    .unwrap();
    assert!(rbac.is_secure());

    assert!(rbac.evaluate(Some("admin"), &put_acl("anything")));
    assert!(rbac.evaluate(Some("ops"), &put_acl("allow-web")));
    assert!(!rbac.evaluate(Some("ops"), &put_acl("deny-all")));
    assert!(rbac.evaluate(Some("ops"), &Action::new(Resource::Peers, Verb::Get, "n1")));
    assert!(rbac.evaluate(
        Some("stranger"),
        &Action::new(Resource::NetworkAcls, Verb::Get, "x")
    ));
    assert!(!rbac.evaluate(Some("stranger"), &put_acl("x")));
    assert!(!rbac.evaluate(None, &Action::new(Resource::NetworkAcls, Verb::Get, "x")));
}

#[test]
fn static_rbac_should_reject_malformed_rules() {
    assert!(StaticRbac::from_config(&grants(&[("a", &["network-acls:put"][..])])).is_err());
    assert!(StaticRbac::from_config(&grants(&[("a", &["routes:put:*"][..])])).is_err());
    assert!(StaticRbac::from_config(&grants(&[("a", &["peers:patch:*"][..])])).is_err());
}

#[test]
fn action_should_display_as_rule_syntax() {
    assert_eq!(put_acl("web").to_string(), "network-acls:put:web");
    assert_eq!("mesh-state".parse::<Resource>().unwrap(), Resource::MeshState);
}
