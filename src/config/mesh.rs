use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_IPV4_PREFIX;
use crate::constants::DEFAULT_MESH_DOMAIN;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::Result;

/// Mesh-wide settings written once by the bootstrapping node
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MeshConfig {
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: String,

    /// IPv6 /48. A unique local prefix is generated when empty.
    #[serde(default)]
    pub ipv6_prefix: Option<String>,

    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ipv4_prefix: default_ipv4_prefix(),
            ipv6_prefix: None,
            domain: default_domain(),
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        let v4 = self.ipv4_prefix()?;
        if !v4.is_ipv4() {
            return Err(Error::Config(ConfigError::Message(format!(
                "mesh.ipv4_prefix {} is not an IPv4 network",
                v4
            ))));
        }

        if let Some(v6) = self.ipv6_prefix()? {
            if !v6.is_ipv6() || v6.bits() != 48 {
                return Err(Error::Config(ConfigError::Message(format!(
                    "mesh.ipv6_prefix {} must be an IPv6 /48",
                    v6
                ))));
            }
        }

        if self.domain.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "mesh.domain cannot be empty".into(),
            )));
        }
        Ok(())
    }

    pub fn ipv4_prefix(&self) -> Result<IpPrefix> {
        self.ipv4_prefix.parse().map_err(|e| {
            Error::Config(ConfigError::Message(format!("mesh.ipv4_prefix: {}", e)))
        })
    }

    pub fn ipv6_prefix(&self) -> Result<Option<IpPrefix>> {
        match self.ipv6_prefix.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|e| {
                Error::Config(ConfigError::Message(format!("mesh.ipv6_prefix: {}", e)))
            }),
        }
    }
}

fn default_ipv4_prefix() -> String {
    DEFAULT_IPV4_PREFIX.to_string()
}
fn default_domain() -> String {
    DEFAULT_MESH_DOMAIN.to_string()
}
