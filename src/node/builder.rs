//! Assembles a [`Node`] from [`Settings`].
//!
//! Components are created bottom-up: storage engine, state machine,
//! [`Raft`], [`RaftStorage`], plugin manager, services. Defaults suit a
//! standalone node; embedded clusters share one [`LocalNetwork`] and one
//! [`LocalDialer`] through the setter methods.
//!
//! ## Example
//! ```ignore
//! let node = NodeBuilder::new(settings)
//!     .network(network.clone())
//!     .dialer(dialer.clone())
//!     .build()
//!     .await?;
//! node.bootstrap().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Node;
use crate::config::Settings;
use crate::consensus::Consensus;
use crate::consensus::LocalNetwork;
use crate::consensus::Raft;
use crate::constants::BUILTIN_IPAM_PLUGIN;
use crate::constants::STATE_MACHINE_META_TREE;
use crate::constants::STATE_MACHINE_TREE;
use crate::meshdb::MeshDb;
use crate::plugins::builtins;
use crate::plugins::Capability;
use crate::plugins::Plugin;
use crate::plugins::PluginManager;
use crate::services::AdminService;
use crate::services::AllowAll;
use crate::services::LeaderProxy;
use crate::services::LocalDialer;
use crate::services::MembershipService;
use crate::services::MeshApi;
use crate::services::MeshServer;
use crate::services::NodeService;
use crate::services::RbacEvaluator;
use crate::services::StaticRbac;
use crate::storage::MemoryEngine;
use crate::storage::MeshStateMachine;
use crate::storage::MeshStorage;
use crate::storage::RaftStorage;
use crate::storage::SledEngine;
use crate::storage::StorageEngine;
use crate::PluginError;
use crate::Result;

pub struct NodeBuilder {
    settings: Settings,
    engine: Option<Arc<dyn StorageEngine>>,
    network: Option<Arc<LocalNetwork>>,
    dialer: Option<Arc<LocalDialer>>,
    /// Instances used instead of the built-in plugin of the same name
    plugins: Vec<(String, Arc<dyn Plugin>)>,
}

impl NodeBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            engine: None,
            network: None,
            dialer: None,
            plugins: Vec::new(),
        }
    }

    /// Overrides the engine derived from `node.in_memory` / `node.data_dir`
    pub fn storage_engine(
        mut self,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Consensus network shared with other in-process nodes
    pub fn network(
        mut self,
        network: Arc<LocalNetwork>,
    ) -> Self {
        self.network = Some(network);
        self
    }

    /// Dialer used by the leader proxy to reach the leader's services
    pub fn dialer(
        mut self,
        dialer: Arc<LocalDialer>,
    ) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Registers `plugin` under `name`. Its configuration is taken from the
    /// `plugins` section when present, empty otherwise.
    pub fn plugin(
        mut self,
        name: impl Into<String>,
        plugin: Arc<dyn Plugin>,
    ) -> Self {
        self.plugins.push((name.into(), plugin));
        self
    }

    /// Opens storage, starts consensus tasks and loads plugins.
    ///
    /// # Errors
    /// - `Error::Config` for invalid settings
    /// - `PluginError::UnknownPlugin` for a configured plugin that is neither
    ///   built in nor supplied through [`NodeBuilder::plugin`]
    /// - any storage or plugin registration failure
    pub async fn build(self) -> Result<Node> {
        self.settings.validate()?;
        let settings = Arc::new(self.settings);
        let id = settings.node.id.clone();

        let engine: Arc<dyn StorageEngine> = match self.engine {
            Some(engine) => engine,
            None if settings.node.in_memory => Arc::new(MemoryEngine::new()),
            None => Arc::new(SledEngine::open(settings.node.data_dir.join(&id))?),
        };
        let state_machine = Arc::new(MeshStateMachine::new(
            engine.open_tree(STATE_MACHINE_TREE)?,
            engine.open_tree(STATE_MACHINE_META_TREE)?,
        )?);

        let network = self.network.unwrap_or_else(LocalNetwork::new);
        let raft = Raft::new(
            id.as_str(),
            settings.node.advertise_address.as_str(),
            settings.raft.clone(),
            engine.as_ref(),
            state_machine.clone(),
            Arc::new(network.transport(&id)),
        )?;
        network.register(&id, raft.handler());
        raft.start();
        debug!(node_id = %id, "consensus started");

        let consensus: Arc<dyn Consensus> = Arc::new(raft.clone());
        let storage: Arc<dyn MeshStorage> = Arc::new(RaftStorage::new(
            consensus.clone(),
            state_machine,
            settings.raft.apply_timeout(),
        ));

        let plugins = Arc::new(PluginManager::new(storage.clone()));
        if let Err(e) = load_plugins(&settings, &plugins, self.plugins).await {
            warn!(node_id = %id, "plugin loading failed: {}", e);
            if let Err(close_err) = plugins.close().await {
                warn!("closing plugins: {}", close_err);
            }
            network.deregister(&id);
            raft.shutdown().await?;
            return Err(e);
        }

        let rbac: Arc<dyn RbacEvaluator> = if settings.services.secure {
            Arc::new(StaticRbac::from_config(&settings.services.rbac)?)
        } else {
            Arc::new(AllowAll)
        };
        let db = MeshDb::new(storage.clone());
        let server = MeshServer {
            membership: MembershipService::new(
                consensus.clone(),
                db.clone(),
                plugins.clone(),
                rbac.clone(),
                settings.raft.apply_timeout(),
                settings.raft.barrier_timeout(),
            ),
            admin: AdminService::new(consensus.clone(), db.clone(), rbac),
            nodes: NodeService::new(db.clone()),
        };

        let dialer = self.dialer.unwrap_or_else(LocalDialer::new);
        let api: Arc<dyn MeshApi> = Arc::new(LeaderProxy::new(
            server,
            consensus,
            dialer.clone(),
            settings.services.leader_proxy,
            Duration::from_millis(settings.services.forward_timeout_ms),
        ));
        dialer.register(&id, &api);

        info!(node_id = %id, in_memory = settings.node.in_memory, "node built");
        Ok(Node {
            id,
            settings,
            engine,
            raft,
            db,
            plugins,
            api,
            network,
            dialer,
        })
    }
}

/// Configured plugins in name order, then supplied ones without
/// configuration, then the built-in IPAM plugin when nothing else serves
/// IPv4 allocation.
async fn load_plugins(
    settings: &Settings,
    manager: &PluginManager,
    mut supplied: Vec<(String, Arc<dyn Plugin>)>,
) -> Result<()> {
    let mut configured: Vec<_> = settings.plugins.iter().collect();
    configured.sort_by(|a, b| a.0.cmp(b.0));

    for (name, plugin_settings) in configured {
        let plugin = match supplied.iter().position(|(n, _)| n == name) {
            Some(i) => supplied.remove(i).1,
            None => builtins::builtin(name).ok_or_else(|| PluginError::UnknownPlugin(name.clone()))?,
        };
        manager
            .register(name, plugin, plugin_settings.config.clone())
            .await?;
    }
    for (name, plugin) in supplied {
        manager.register(&name, plugin, serde_json::Map::new()).await?;
    }

    if manager.provider(Capability::Ipamv4).is_none() {
        if let Some(ipam) = builtins::builtin(BUILTIN_IPAM_PLUGIN) {
            debug!("no ipam provider configured, loading the built-in one");
            manager
                .register(BUILTIN_IPAM_PLUGIN, ipam, serde_json::Map::new())
                .await?;
        }
    }
    Ok(())
}
