use std::collections::HashMap;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::utils::id::is_valid_id;
use crate::Error;
use crate::Result;

/// Plugin name to its opaque configuration map
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(transparent)]
pub struct PluginsConfig(pub HashMap<String, PluginSettings>);

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PluginSettings {
    /// Decoded by the plugin itself in `configure`
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl PluginsConfig {
    pub fn validate(&self) -> Result<()> {
        for name in self.0.keys() {
            if !is_valid_id(name) {
                return Err(Error::Config(ConfigError::Message(format!(
                    "plugin name {:?} is not a valid identifier",
                    name
                ))));
            }
        }
        Ok(())
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&PluginSettings> {
        self.0.get(name)
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PluginSettings)> {
        self.0.iter()
    }
}
