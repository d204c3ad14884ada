//! Plugins compiled into the node.

mod debug;
mod ipam;

pub use debug::*;
pub use ipam::*;

use std::sync::Arc;

use super::Plugin;
use crate::constants::BUILTIN_DEBUG_PLUGIN;
use crate::constants::BUILTIN_IPAM_PLUGIN;

/// Instantiates the built-in plugin called `name`
pub fn builtin(name: &str) -> Option<Arc<dyn Plugin>> {
    match name {
        BUILTIN_IPAM_PLUGIN => Some(Arc::new(IpamPlugin::new())),
        BUILTIN_DEBUG_PLUGIN => Some(Arc::new(DebugPlugin::new())),
        _ => None,
    }
}
