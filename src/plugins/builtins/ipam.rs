//! Built-in address allocator.
//!
//! Allocations are derived from the peer records visible through the
//! plugin's query channel; no lease table is kept.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::thread_rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tonic::async_trait;
use tracing::debug;
use tracing::trace;

use crate::constants::BUILTIN_IPAM_PLUGIN;
use crate::constants::IPV6_ALLOCATION_MAX_TRIES;
use crate::meshdb::Peers;
use crate::plugins::AllocateIpRequest;
use crate::plugins::Capability;
use crate::plugins::IpVersion;
use crate::plugins::IpamProvider;
use crate::plugins::Plugin;
use crate::plugins::PluginDb;
use crate::plugins::PluginInfo;
use crate::storage::MeshStorage;
use crate::utils::net::next_ipv4;
use crate::utils::net::random64;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::PluginError;
use crate::Result;

/// Static assignments by node id. They bypass allocation and are never
/// handed out to other nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IpamConfig {
    #[serde(default)]
    pub static_ipv4: HashMap<String, IpPrefix>,
    #[serde(default)]
    pub static_ipv6: HashMap<String, IpPrefix>,
}

impl IpamConfig {
    fn is_static(
        &self,
        prefix: &IpPrefix,
    ) -> bool {
        let table = if prefix.is_ipv4() {
            &self.static_ipv4
        } else {
            &self.static_ipv6
        };
        table.values().any(|p| p == prefix)
    }
}

#[derive(Default)]
pub struct IpamPlugin {
    config: ArcSwap<IpamConfig>,
    /// Held for the whole allocation so close waits for it
    data: Mutex<Option<PluginDb>>,
}

impl IpamPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn allocate_v4(
        &self,
        db: &PluginDb,
        subnet: &IpPrefix,
    ) -> Result<IpPrefix> {
        let config = self.config.load_full();
        let allocated: HashSet<IpPrefix> = Peers::new(Arc::new(db.clone()))
            .list()
            .await?
            .into_iter()
            .filter_map(|n| n.private_ipv4)
            .collect();
        next_ipv4(subnet, |candidate| {
            allocated.contains(candidate) || config.is_static(candidate)
        })
    }

    async fn allocate_v6(
        &self,
        db: &PluginDb,
        subnet: &IpPrefix,
    ) -> Result<IpPrefix> {
        let config = self.config.load_full();
        let allocated: HashSet<IpPrefix> = Peers::new(Arc::new(db.clone()))
            .list()
            .await?
            .into_iter()
            .filter_map(|n| n.private_ipv6)
            .collect();
        let mut rng = thread_rng();
        for _ in 0..IPV6_ALLOCATION_MAX_TRIES {
            let candidate = random64(subnet, &mut rng)?;
            if !allocated.contains(&candidate) && !config.is_static(&candidate) {
                return Ok(candidate);
            }
            trace!("ipv6 candidate {} collides, retrying", candidate);
        }
        Err(Error::Exhausted(format!(
            "{} after {} tries",
            subnet, IPV6_ALLOCATION_MAX_TRIES
        )))
    }
}

#[async_trait]
impl Plugin for IpamPlugin {
    fn get_info(&self) -> PluginInfo {
        PluginInfo {
            name: BUILTIN_IPAM_PLUGIN.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Simple IPAM plugin".to_string(),
            capabilities: vec![Capability::Ipamv4, Capability::Ipamv6],
        }
    }

    async fn configure(
        &self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let config: IpamConfig = serde_json::from_value(serde_json::Value::Object(config))?;
        debug!(
            ipv4 = config.static_ipv4.len(),
            ipv6 = config.static_ipv6.len(),
            "loaded static assignments"
        );
        self.config.store(Arc::new(config));
        Ok(())
    }

    async fn inject_querier(
        &self,
        db: PluginDb,
    ) -> Result<()> {
        *self.data.lock().await = Some(db);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let db = self.data.lock().await.take();
        match db {
            Some(db) => db.close().await,
            None => Ok(()),
        }
    }

    fn as_ipam(&self) -> Option<&dyn IpamProvider> {
        Some(self)
    }
}

#[async_trait]
impl IpamProvider for IpamPlugin {
    async fn allocate(
        &self,
        req: AllocateIpRequest,
    ) -> Result<IpPrefix> {
        let data = self.data.lock().await;
        let Some(db) = data.as_ref() else {
            return Err(PluginError::NotConfigured.into());
        };
        let config = self.config.load_full();
        let fixed = match req.version {
            IpVersion::V4 => config.static_ipv4.get(&req.node_id),
            IpVersion::V6 => config.static_ipv6.get(&req.node_id),
        };
        if let Some(prefix) = fixed {
            debug!(node_id = %req.node_id, "static assignment {}", prefix);
            return Ok(*prefix);
        }

        let prefix = match req.version {
            IpVersion::V4 => self.allocate_v4(db, &req.subnet).await?,
            IpVersion::V6 => self.allocate_v6(db, &req.subnet).await?,
        };
        debug!(node_id = %req.node_id, "allocated {}", prefix);
        Ok(prefix)
    }

    async fn release(
        &self,
        _node_id: &str,
        _version: IpVersion,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "ipam_test.rs"]
mod ipam_test;
