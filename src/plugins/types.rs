use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::meshdb::MeshNode;
use crate::utils::net::IpPrefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// May write through its query channel
    Storage,
    /// Receives node join/leave events
    Watch,
    Ipamv4,
    Ipamv6,
}

impl fmt::Display for Capability {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Capability::Storage => "storage",
            Capability::Watch => "watch",
            Capability::Ipamv4 => "ipamv4",
            Capability::Ipamv6 => "ipamv6",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<Capability>,
}

impl PluginInfo {
    pub fn has(
        &self,
        capability: Capability,
    ) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn capability(self) -> Capability {
        match self {
            IpVersion::V4 => Capability::Ipamv4,
            IpVersion::V6 => Capability::Ipamv6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateIpRequest {
    pub node_id: String,
    /// Global pool to allocate from
    pub subnet: IpPrefix,
    pub version: IpVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    NodeJoin,
    NodeLeave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventType,
    pub node: MeshNode,
}
