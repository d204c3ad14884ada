//! Configuration management for a mesh node.
//!
//! Provides layered configuration loading with priority:
//! 1. Default values (hardcoded)
//! 2. Config file (explicit path, else `CONFIG_PATH`)
//! 3. Environment variables prefixed with `MESH` (highest priority)
//!
//! Example: `MESH__RAFT__APPLY_TIMEOUT_MS=5000` overrides `raft.apply_timeout_ms`.

mod mesh;
mod monitoring;
mod node;
mod plugins;
mod raft;
mod services;
pub use mesh::*;
pub use monitoring::*;
pub use node::*;
pub use plugins::*;
pub use raft::*;
pub use services::*;


//---
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Identity, addresses and storage location of this node
    #[serde(default)]
    pub node: NodeConfig,
    /// Replicated log parameters
    #[serde(default)]
    pub raft: RaftConfig,
    /// RPC surface behaviour: forwarding and authorization
    #[serde(default)]
    pub services: ServicesConfig,
    /// Mesh-wide settings written at bootstrap
    #[serde(default)]
    pub mesh: MeshConfig,
    /// Plugin name to opaque configuration map
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Metrics settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Load configuration from defaults, an optional file and the
    /// environment, then validate it.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to a TOML file; falls back to the
    ///   `CONFIG_PATH` environment variable when absent
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        // 1. Config file
        if let Some(path) = config_path {
            config = config.add_source(File::with_name(path).required(true));
        } else if let Ok(path) = env::var("CONFIG_PATH") {
            config = config.add_source(File::with_name(&path).required(true));
        }

        // 2. Environment variables (highest priority)
        config = config.add_source(
            Environment::with_prefix("MESH")
                .prefix_separator("__")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let mut settings: Settings = config.build()?.try_deserialize()?;
        settings.node.resolve_id()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.raft.validate()?;
        self.services.validate()?;
        self.mesh.validate()?;
        self.plugins.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}
