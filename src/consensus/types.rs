use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Node identifier as used across the cluster and the mesh database
pub type NodeId = String;

/// Position of an entry in the replicated log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(
        term: u64,
        index: u64,
    ) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader and by barriers
    Noop,
    /// Opaque state machine command
    Command(Vec<u8>),
    /// Cluster configuration, effective as soon as it is appended
    Config(Membership),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn index(&self) -> u64 {
        self.log_id.index
    }

    pub fn term(&self) -> u64 {
        self.log_id.term
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    /// Counts towards quorum and may become leader
    Voter,
    /// Receives the log, never votes
    NonVoter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    /// Raft address; the in-process transport keys on `id` only
    pub address: String,
    pub suffrage: Suffrage,
}

impl Server {
    pub fn voter(
        id: impl Into<NodeId>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::Voter,
        }
    }

    pub fn non_voter(
        id: impl Into<NodeId>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::NonVoter,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.suffrage == Suffrage::Voter
    }
}

/// Set of servers taking part in replication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    servers: BTreeMap<NodeId, Server>,
}

impl Membership {
    pub fn new(servers: impl IntoIterator<Item = Server>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn contains(
        &self,
        id: &str,
    ) -> bool {
        self.servers.contains_key(id)
    }

    pub fn is_voter(
        &self,
        id: &str,
    ) -> bool {
        self.servers.get(id).map(Server::is_voter).unwrap_or(false)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.values().filter(|s| s.is_voter())
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub(crate) fn with_server(
        &self,
        server: Server,
    ) -> Self {
        let mut next = self.clone();
        next.servers.insert(server.id.clone(), server);
        next
    }

    pub(crate) fn without_server(
        &self,
        id: &str,
    ) -> Self {
        let mut next = self.clone();
        next.servers.remove(id);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Term and vote; persisted before answering any RPC that changed them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included: LogId,
    pub membership: Membership,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// Serialized state machine contents
    pub data: Vec<u8>,
}

// -
// Peer RPCs

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last log index; lets the leader skip back on conflicts
    pub last_log_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}
