use std::collections::HashMap;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServicesConfig {
    /// Forward write RPCs received by a follower to the current leader
    #[serde(default = "default_leader_proxy")]
    pub leader_proxy: bool,

    /// Enforce caller identity and RBAC checks
    #[serde(default = "default_secure")]
    pub secure: bool,

    /// Static grants: caller id (or `*`) to a list of
    /// `resource:verb:name` rules. Any segment may be `*`.
    #[serde(default)]
    pub rbac: HashMap<String, Vec<String>>,

    /// Deadline for a forwarded request
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            leader_proxy: default_leader_proxy(),
            secure: default_secure(),
            rbac: HashMap::new(),
            forward_timeout_ms: default_forward_timeout_ms(),
        }
    }
}

impl ServicesConfig {
    pub fn validate(&self) -> Result<()> {
        for (caller, rules) in &self.rbac {
            for rule in rules {
                if rule != "*" && rule.split(':').count() != 3 {
                    return Err(Error::Config(ConfigError::Message(format!(
                        "rbac rule {:?} for {} must be `*` or `resource:verb:name`",
                        rule, caller
                    ))));
                }
            }
        }

        if self.forward_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "forward_timeout_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_leader_proxy() -> bool {
    true
}
fn default_secure() -> bool {
    true
}
fn default_forward_timeout_ms() -> u64 {
    15_000
}
