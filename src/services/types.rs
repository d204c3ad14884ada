use serde::Deserialize;
use serde::Serialize;

use crate::meshdb::FeaturePort;
use crate::meshdb::MeshNode;
use crate::utils::net::IpPrefix;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub public_key: String,
    #[serde(default)]
    pub primary_endpoint: Option<String>,
    #[serde(default)]
    pub wireguard_endpoints: Vec<String>,
    #[serde(default)]
    pub zone_awareness_id: Option<String>,
    #[serde(default)]
    pub features: Vec<FeaturePort>,
    /// Join the consensus group as a voter
    #[serde(default)]
    pub as_voter: bool,
    /// Join the consensus group as a non-voter
    #[serde(default)]
    pub as_observer: bool,
    #[serde(default)]
    pub assign_ipv4: bool,
    /// Use the private IPv6 address for consensus traffic
    #[serde(default)]
    pub prefer_raft_ipv6: bool,
    /// Explicit consensus address; derived from the private address otherwise
    #[serde(default)]
    pub raft_address: Option<String>,
}

impl JoinRequest {
    pub fn new(
        id: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            public_key: public_key.into(),
            ..Default::default()
        }
    }

    pub fn joins_consensus(&self) -> bool {
        self.as_voter || self.as_observer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub address_ipv4: Option<IpPrefix>,
    pub address_ipv6: Option<IpPrefix>,
    pub network_ipv4: IpPrefix,
    pub network_ipv6: Option<IpPrefix>,
    pub mesh_domain: String,
    /// Every peer other than the caller
    pub peers: Vec<MeshNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNetworkAclRequest {
    pub name: String,
}
