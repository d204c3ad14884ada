//! Consensus Core
//!
//! A single-leader replicated log. The rest of the crate only talks to it
//! through [`Consensus`]: append a command and wait for it to apply, ask who
//! leads, wait on a barrier, change the voter set.
//!
//! [`Raft`] is the bundled implementation. Peers reach each other through a
//! [`RaftTransport`]; [`LocalNetwork`] wires nodes living in one process.

mod raft;
mod transport;
mod types;

pub use raft::*;
pub use transport::*;
pub use types::*;

#[cfg(test)]
mod transport_test;

use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

use crate::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// Local node id
    fn id(&self) -> NodeId;

    /// Appends `command` and returns once a quorum stored it and it has been
    /// applied locally.
    ///
    /// # Errors
    /// - `ConsensusError::NotLeader` on a follower
    /// - `Error::Timeout` when no quorum is reached within `timeout`. The
    ///   entry may still commit later.
    async fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> Result<LogId>;

    fn is_leader(&self) -> bool;

    /// Current leader as known by this node
    ///
    /// # Errors
    /// `ConsensusError::NoLeader` while an election is in progress
    fn leader(&self) -> Result<Server>;

    /// Waits until every entry committed before the call is applied locally
    async fn barrier(
        &self,
        timeout: Duration,
    ) -> Result<()>;

    /// Adds or updates a server. Leader only.
    async fn add_server(
        &self,
        server: Server,
        timeout: Duration,
    ) -> Result<()>;

    /// Removes a server. Leader only.
    ///
    /// # Errors
    /// `ConsensusError::UnknownServer` when `id` is not a member
    async fn remove_server(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Latest configuration known to this node
    fn membership(&self) -> Membership;

    fn last_applied(&self) -> LogId;

    /// Stops timers and the apply loop
    async fn shutdown(&self) -> Result<()>;
}
