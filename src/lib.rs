//! # meshnode
//!
//! Control plane of a WireGuard mesh. Nodes replicate a small key/value
//! registry (peers, network ACLs, mesh-wide settings) through a single-leader
//! consensus log, hand out private addresses through IPAM plugins and expose
//! Join/Leave/GetNode and ACL administration to their peers.
//!
//! ## Layout
//! - [`consensus`]: replicated log behind the [`consensus::Consensus`] trait
//! - [`storage`]: storage engines, the mesh state machine and
//!   [`storage::MeshStorage`]
//! - [`meshdb`]: typed accessors over the registry
//! - [`services`]: RPC handlers and the leader proxy
//! - [`plugins`]: plugin manager, query protocol and built-in plugins
//! - [`node`]: wiring of one node from [`config::Settings`]

pub mod config;
pub mod consensus;
pub mod constants;
mod errors;
pub mod meshdb;
pub mod metrics;
pub mod node;
pub mod plugins;
pub mod services;
pub mod storage;
pub mod utils;

pub use errors::*;

#[cfg(test)]
pub(crate) mod test_utils;
