use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::NODE_ID_FILE;
use crate::utils::id::is_valid_id;
use crate::Error;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    /// Node identifier. When unset it is generated, and on-disk nodes keep
    /// the generated id under `data_dir` across restarts.
    #[serde(default)]
    pub id: String,

    /// Address other nodes use to reach this node's RPC surface
    #[serde(default = "default_advertise_address")]
    pub advertise_address: String,

    /// WireGuard public key published in this node's peer record
    #[serde(default)]
    pub public_key: String,

    /// Root directory of the on-disk stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Keep every store in memory. Nothing survives a restart.
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            advertise_address: default_advertise_address(),
            public_key: String::new(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            in_memory: false,
        }
    }
}

impl NodeConfig {
    /// Fills an unset `id`: in-memory nodes get a fresh one, on-disk nodes
    /// reuse the id stored in `data_dir` or store a new one there.
    pub fn resolve_id(&mut self) -> Result<()> {
        if !self.id.is_empty() {
            return Ok(());
        }
        if self.in_memory {
            self.id = default_node_id();
            return Ok(());
        }

        let path = self.data_dir.join(NODE_ID_FILE);
        match fs::read_to_string(&path) {
            Ok(id) => self.id = id.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let id = default_node_id();
                fs::create_dir_all(&self.data_dir).map_err(|e| id_file_error(&path, e))?;
                fs::write(&path, &id).map_err(|e| id_file_error(&path, e))?;
                self.id = id;
            }
            Err(e) => return Err(id_file_error(&path, e)),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_id(&self.id) {
            return Err(Error::Config(ConfigError::Message(format!(
                "node.id {:?} is not a valid identifier",
                self.id
            ))));
        }

        if self.advertise_address.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "node.advertise_address cannot be empty".into(),
            )));
        }

        if !self.in_memory && self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "node.data_dir is required unless in_memory is set".into(),
            )));
        }

        Ok(())
    }
}

fn id_file_error(
    path: &Path,
    e: io::Error,
) -> Error {
    Error::from(StorageError::IoError(e)).context(format!("node id file {:?}", path))
}

fn default_node_id() -> String {
    nanoid::nanoid!(12, &nanoid::alphabet::SAFE)
}
fn default_advertise_address() -> String {
    "127.0.0.1:8443".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/meshnode/data")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/meshnode/logs")
}
