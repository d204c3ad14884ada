use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use super::decode;
use super::encode;
use crate::constants::NETWORK_ACLS_PREFIX;
use crate::constants::WILDCARD;
use crate::storage::MeshStorage;
use crate::utils::id::is_valid_id;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Accept,
    Deny,
}

/// Named network ACL. At least one match set must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAcl {
    pub name: String,
    /// Higher priority rules are evaluated first
    #[serde(default)]
    pub priority: i32,
    pub action: AclAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_cidrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_cidrs: Vec<String>,
}

impl NetworkAcl {
    pub fn new(
        name: impl Into<String>,
        action: AclAction,
    ) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            action,
            source_nodes: Vec::new(),
            destination_nodes: Vec::new(),
            source_cidrs: Vec::new(),
            destination_cidrs: Vec::new(),
        }
    }

    pub fn has_match_set(&self) -> bool {
        !(self.source_nodes.is_empty()
            && self.destination_nodes.is_empty()
            && self.source_cidrs.is_empty()
            && self.destination_cidrs.is_empty())
    }

    /// Structural checks: valid name, at least one match set, parseable
    /// CIDRs and node ids (`*` allowed).
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("acl name is required".to_string()));
        }
        if !is_valid_id(&self.name) {
            return Err(Error::InvalidArgument("acl name must be a valid ID".to_string()));
        }
        if !self.has_match_set() {
            return Err(Error::InvalidArgument(
                "at least one of destination_cidrs, source_cidrs, source_nodes, or destination_nodes must be set"
                    .to_string(),
            ));
        }
        for cidr in self.source_cidrs.iter().chain(&self.destination_cidrs) {
            if cidr == WILDCARD {
                continue;
            }
            cidr.parse::<IpPrefix>()
                .map_err(|e| Error::InvalidArgument(format!("invalid cidr {:?}: {}", cidr, e)))?;
        }
        for node in self.source_nodes.iter().chain(&self.destination_nodes) {
            if node != WILDCARD && !is_valid_id(node) {
                return Err(Error::InvalidArgument(format!("invalid node id {:?}", node)));
            }
        }
        Ok(())
    }
}

/// Network ACL records
#[derive(Clone)]
pub struct Networking {
    db: Arc<dyn MeshStorage>,
}

impl Networking {
    pub fn new(db: Arc<dyn MeshStorage>) -> Self {
        Self { db }
    }

    pub async fn put_network_acl(
        &self,
        acl: &NetworkAcl,
    ) -> Result<()> {
        acl.validate()?;
        self.db.put_value(&acl_key(&acl.name), encode(acl)?).await
    }

    /// # Errors
    /// `Error::NotFound` when no ACL has this name
    pub async fn get_network_acl(
        &self,
        name: &str,
    ) -> Result<NetworkAcl> {
        match self.db.get_value(&acl_key(name)).await {
            Ok(bytes) => decode(&bytes),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("network acl {:?}", name))),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_network_acl(
        &self,
        name: &str,
    ) -> Result<()> {
        self.db.delete(&acl_key(name)).await
    }

    /// All ACLs, highest priority first
    pub async fn list_network_acls(&self) -> Result<Vec<NetworkAcl>> {
        let mut acls: Vec<NetworkAcl> = Vec::new();
        self.db
            .iter_prefix(NETWORK_ACLS_PREFIX, &mut |_, value| {
                acls.push(decode(value)?);
                Ok(())
            })
            .await?;
        acls.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(acls)
    }
}

fn acl_key(name: &str) -> String {
    format!("{}{}", NETWORK_ACLS_PREFIX, name)
}
