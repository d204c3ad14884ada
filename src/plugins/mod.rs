//! Plugin extension surface.
//!
//! A plugin declares a closed set of [`Capability`] values; each one must be
//! backed by the matching capability view ([`Plugin::as_ipam`],
//! [`Plugin::as_watcher`]) or registration fails. After `configure`, the
//! manager opens a query channel and hands the plugin a [`PluginDb`] through
//! which it reads (and, when storage-capable, writes) the mesh database.

pub mod builtins;
mod manager;
mod plugin_db;
mod query;
mod types;

pub use manager::*;
pub use plugin_db::*;
pub use query::*;
pub use types::*;

#[cfg(test)]
mod manager_test;

use tonic::async_trait;

use crate::utils::net::IpPrefix;
use crate::Result;

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn get_info(&self) -> PluginInfo;

    /// Decodes and applies the opaque configuration map. Called once before
    /// the query channel is opened.
    async fn configure(
        &self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    /// Hands over the plugin's end of its query channel
    async fn inject_querier(
        &self,
        db: PluginDb,
    ) -> Result<()>;

    /// Releases the query channel and anything the plugin started
    async fn close(&self) -> Result<()>;

    fn as_ipam(&self) -> Option<&dyn IpamProvider> {
        None
    }

    fn as_watcher(&self) -> Option<&dyn EventWatcher> {
        None
    }
}

/// Address allocation for joining nodes
#[async_trait]
pub trait IpamProvider: Send + Sync {
    async fn allocate(
        &self,
        req: AllocateIpRequest,
    ) -> Result<IpPrefix>;

    /// Leases are not tracked; addresses free up when the peer is deleted
    async fn release(
        &self,
        node_id: &str,
        version: IpVersion,
    ) -> Result<()>;
}

/// Receives mesh events after they committed
#[async_trait]
pub trait EventWatcher: Send + Sync {
    async fn emit(
        &self,
        event: Event,
    ) -> Result<()>;
}
