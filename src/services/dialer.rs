use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tonic::async_trait;
use tracing::debug;

use super::MeshApi;
use crate::consensus::Server;
use crate::NetworkError;
use crate::Result;

/// Opens a client to the current leader's RPC surface
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaderDialer: Send + Sync + 'static {
    async fn dial(
        &self,
        leader: &Server,
    ) -> Result<Arc<dyn MeshApi>>;
}

/// Dials services living in the same process, keyed by node id
#[derive(Default)]
pub struct LocalDialer {
    services: DashMap<String, Weak<dyn MeshApi>>,
}

impl LocalDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        node_id: &str,
        service: &Arc<dyn MeshApi>,
    ) {
        debug!("register mesh api of {}", node_id);
        self.services.insert(node_id.to_string(), Arc::downgrade(service));
    }

    pub fn deregister(
        &self,
        node_id: &str,
    ) {
        self.services.remove(node_id);
    }
}

#[async_trait]
impl LeaderDialer for LocalDialer {
    async fn dial(
        &self,
        leader: &Server,
    ) -> Result<Arc<dyn MeshApi>> {
        self.services
            .get(&leader.id)
            .and_then(|s| s.upgrade())
            .ok_or_else(|| {
                NetworkError::Unreachable {
                    node_id: leader.id.clone(),
                }
                .into()
            })
    }
}
