use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::AppendEntriesRequest;
use super::AppendEntriesResponse;
use super::Consensus;
use super::Entry;
use super::EntryPayload;
use super::HardState;
use super::InstallSnapshotRequest;
use super::InstallSnapshotResponse;
use super::LogId;
use super::Membership;
use super::NodeId;
use super::RaftHandler;
use super::RaftTransport;
use super::Role;
use super::Server;
use super::Snapshot;
use super::SnapshotMeta;
use super::VoteRequest;
use super::VoteResponse;
use crate::config::RaftConfig;
use crate::constants::RAFT_LOG_TREE;
use crate::constants::RAFT_STATE_TREE;
use crate::metrics::APPLIED_ENTRIES;
use crate::metrics::APPLY_LATENCY;
use crate::metrics::IS_LEADER;
use crate::storage::RaftLog;
use crate::storage::StateMachine;
use crate::storage::StateStorage;
use crate::storage::StorageEngine;
use crate::utils::async_task::wait_with_deadline;
use crate::utils::cluster::is_majority;
use crate::utils::cluster::majority_count;
use crate::ConsensusError;
use crate::Error;
use crate::Result;

/// Upper bound on request rounds sent to one peer per replication pass
const MAX_ROUNDS_PER_PEER: usize = 64;

/// Cloneable handle to a raft node
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

struct RaftInner {
    id: NodeId,
    address: String,
    config: RaftConfig,

    log: RaftLog,
    state_storage: StateStorage,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,

    state: Mutex<RaftState>,
    /// One replication pass at a time
    replication: tokio::sync::Mutex<()>,
    /// One uncommitted configuration change at a time
    config_change: tokio::sync::Mutex<()>,
    /// Membership as of the last applied entry, captured by snapshots
    applied_membership: Mutex<Membership>,

    commit_tx: watch::Sender<u64>,
    applied_tx: watch::Sender<LogId>,

    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct RaftState {
    role: Role,
    hard_state: HardState,
    leader_id: Option<NodeId>,
    commit_index: u64,
    /// Latest configuration in the log, applied or not
    membership: Membership,
    /// Last entry in the log, or the snapshot boundary when the log is empty
    last_log_id: LogId,
    snapshot_meta: Option<SnapshotMeta>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_contact: Instant,
    election_timeout: Duration,
}

impl RaftState {
    fn snapshot_index(&self) -> u64 {
        self.snapshot_meta.as_ref().map(|m| m.last_included.index).unwrap_or(0)
    }
}

impl Raft {
    /// Opens (or recovers) the log and hard state from `engine`.
    ///
    /// Nothing runs until [`Raft::start`].
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        config: RaftConfig,
        engine: &dyn StorageEngine,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        let id = id.into();
        let log = RaftLog::new(engine.open_tree(RAFT_LOG_TREE)?);
        let state_storage = StateStorage::new(engine.open_tree(RAFT_STATE_TREE)?);

        let hard_state = state_storage.load_hard_state()?.unwrap_or_default();
        let snapshot = state_storage.load_snapshot()?;

        if let Some(snapshot) = &snapshot {
            if state_machine.last_applied().index < snapshot.meta.last_included.index {
                info!(
                    "state machine behind snapshot {}, restoring",
                    snapshot.meta.last_included
                );
                state_machine.apply_snapshot(snapshot.meta.last_included, &snapshot.data)?;
            }
        }
        let snapshot_meta = snapshot.map(|s| s.meta);

        let membership = match log.last_membership()? {
            Some((_, m)) => m,
            None => snapshot_meta
                .as_ref()
                .map(|m| m.membership.clone())
                .unwrap_or_default(),
        };
        let last_log_id = match log.last_log_id()? {
            Some(id) => id,
            None => snapshot_meta.as_ref().map(|m| m.last_included).unwrap_or_default(),
        };

        let last_applied = state_machine.last_applied();
        let applied_membership = match log.last_membership_upto(last_applied.index)? {
            Some((_, m)) => m,
            None => snapshot_meta
                .as_ref()
                .map(|m| m.membership.clone())
                .unwrap_or_default(),
        };

        info!(
            node_id = %id,
            term = hard_state.current_term,
            last_log = %last_log_id,
            last_applied = %last_applied,
            "raft node opened"
        );

        let (commit_tx, _) = watch::channel(last_applied.index);
        let (applied_tx, _) = watch::channel(last_applied);
        let election_timeout = random_election_timeout(&config);

        Ok(Self {
            inner: Arc::new(RaftInner {
                id,
                address: address.into(),
                config,
                log,
                state_storage,
                state_machine,
                transport,
                state: Mutex::new(RaftState {
                    role: Role::Follower,
                    hard_state,
                    leader_id: None,
                    commit_index: last_applied.index,
                    membership,
                    last_log_id,
                    snapshot_meta,
                    next_index: HashMap::new(),
                    match_index: HashMap::new(),
                    last_contact: Instant::now(),
                    election_timeout,
                }),
                replication: tokio::sync::Mutex::new(()),
                config_change: tokio::sync::Mutex::new(()),
                applied_membership: Mutex::new(applied_membership),
                commit_tx,
                applied_tx,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Inbound RPC handler, for registration with a transport
    pub fn handler(&self) -> Weak<dyn RaftHandler> {
        let weak: Weak<RaftInner> = Arc::downgrade(&self.inner);
        weak
    }

    /// Spawns the apply loop and, with `auto_campaign`, the election and
    /// heartbeat timer.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move { inner.run_apply_loop().await }));

        if self.inner.config.auto_campaign {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move { inner.run_timer_loop().await }));
        }
    }

    /// Writes the initial configuration with this node as the only voter.
    ///
    /// Returns false when the node already has state.
    pub fn bootstrap(&self) -> Result<bool> {
        self.inner.bootstrap()
    }

    /// Runs one election round for the next term.
    ///
    /// # Errors
    /// - `ConsensusError::Membership` when this node is not a voter
    /// - `ConsensusError::QuorumNotReached` when too few votes were granted
    /// - `ConsensusError::HigherTerm` when a peer is ahead
    pub async fn campaign(&self) -> Result<()> {
        self.inner.campaign().await
    }

    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    pub fn current_term(&self) -> u64 {
        self.inner.state.lock().hard_state.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.state.lock().commit_index
    }

    pub fn last_log_id(&self) -> LogId {
        self.inner.state.lock().last_log_id
    }

    pub fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.inner.state.lock().snapshot_meta.clone()
    }
}

#[async_trait]
impl Consensus for Raft {
    fn id(&self) -> NodeId {
        self.inner.id.clone()
    }

    async fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> Result<LogId> {
        let started = Instant::now();
        let result = self
            .inner
            .append_with_timeout(EntryPayload::Command(command), timeout)
            .await;
        APPLY_LATENCY.observe(started.elapsed().as_secs_f64());
        result
    }

    fn is_leader(&self) -> bool {
        self.inner.state.lock().role == Role::Leader
    }

    fn leader(&self) -> Result<Server> {
        let st = self.inner.state.lock();
        let leader_id = st.leader_id.clone().ok_or(ConsensusError::NoLeader)?;
        if leader_id == self.inner.id {
            return Ok(st
                .membership
                .get(&leader_id)
                .cloned()
                .unwrap_or_else(|| Server::voter(leader_id.clone(), self.inner.address.clone())));
        }
        Ok(st
            .membership
            .get(&leader_id)
            .cloned()
            .unwrap_or_else(|| Server::voter(leader_id, String::new())))
    }

    async fn barrier(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_leader() {
            self.inner.append_with_timeout(EntryPayload::Noop, timeout).await?;
            return Ok(());
        }
        let commit = self.commit_index();
        wait_with_deadline(self.inner.wait_applied(commit), timeout, Some(&self.inner.shutdown)).await
    }

    #[instrument(skip(self, timeout))]
    async fn add_server(
        &self,
        server: Server,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = self.inner.config_change.lock().await;
        let next = {
            let st = self.inner.state.lock();
            self.inner.ensure_leader(&st)?;
            if st.membership.get(&server.id) == Some(&server) {
                debug!("server {} already present", server.id);
                return Ok(());
            }
            st.membership.with_server(server.clone())
        };
        info!("adding server {} ({:?})", server.id, server.suffrage);
        self.inner.append_with_timeout(EntryPayload::Config(next), timeout).await?;
        Ok(())
    }

    #[instrument(skip(self, timeout))]
    async fn remove_server(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = self.inner.config_change.lock().await;
        let next = {
            let st = self.inner.state.lock();
            self.inner.ensure_leader(&st)?;
            if !st.membership.contains(id) {
                return Err(ConsensusError::UnknownServer(id.to_string()).into());
            }
            if st.membership.is_voter(id) && st.membership.voter_count() == 1 {
                return Err(ConsensusError::Membership(format!(
                    "cannot remove {}: last voter",
                    id
                ))
                .into());
            }
            st.membership.without_server(id)
        };
        info!("removing server {}", id);
        self.inner.append_with_timeout(EntryPayload::Config(next), timeout).await?;

        if id == self.inner.id {
            let mut st = self.inner.state.lock();
            info!("removed self from the cluster, stepping down");
            let term = st.hard_state.current_term;
            self.inner.become_follower(&mut st, term, None)?;
        }
        Ok(())
    }

    fn membership(&self) -> Membership {
        self.inner.state.lock().membership.clone()
    }

    fn last_applied(&self) -> LogId {
        self.inner.state_machine.last_applied()
    }

    async fn shutdown(&self) -> Result<()> {
        info!(node_id = %self.inner.id, "raft shutting down");
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("raft task ended abnormally: {:?}", e);
            }
        }
        {
            let mut st = self.inner.state.lock();
            st.role = Role::Follower;
            st.leader_id = None;
        }
        self.inner.state_machine.flush()?;
        self.inner.log.flush()
    }
}

impl RaftInner {
    fn ensure_leader(
        &self,
        st: &RaftState,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ConsensusError::Shutdown.into());
        }
        if st.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                leader_id: st.leader_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn bootstrap(&self) -> Result<bool> {
        let mut st = self.state.lock();
        if st.hard_state.current_term > 0 || st.last_log_id.index > 0 || !self.log.is_empty() {
            debug!("node {} already has state, skip bootstrap", self.id);
            return Ok(false);
        }
        let membership = Membership::new([Server::voter(self.id.clone(), self.address.clone())]);
        let entry = Entry {
            log_id: LogId::new(0, 1),
            payload: EntryPayload::Config(membership.clone()),
        };
        self.log.append(&[entry])?;
        st.membership = membership;
        st.last_log_id = LogId::new(0, 1);
        info!(node_id = %self.id, "bootstrapped single-voter cluster");
        Ok(true)
    }

    /// Leader-side append of one entry; the entry is durable locally when
    /// this returns.
    fn append_local(
        &self,
        payload: EntryPayload,
    ) -> Result<LogId> {
        let mut st = self.state.lock();
        self.ensure_leader(&st)?;

        let log_id = LogId::new(st.hard_state.current_term, st.last_log_id.index + 1);
        if let EntryPayload::Config(membership) = &payload {
            st.membership = membership.clone();
            let next = log_id.index + 1;
            for server in membership.servers() {
                st.next_index.entry(server.id.clone()).or_insert(next);
                st.match_index.entry(server.id.clone()).or_insert(0);
            }
        }
        self.log.append(&[Entry { log_id, payload }])?;
        st.last_log_id = log_id;
        trace!("leader appended {}", log_id);

        self.advance_commit(&mut st);
        Ok(log_id)
    }

    async fn append_with_timeout(
        self: &Arc<Self>,
        payload: EntryPayload,
        timeout: Duration,
    ) -> Result<LogId> {
        wait_with_deadline(self.append_and_wait(payload), timeout, None).await
    }

    async fn append_and_wait(
        self: &Arc<Self>,
        payload: EntryPayload,
    ) -> Result<LogId> {
        let log_id = self.append_local(payload)?;

        loop {
            if self.state.lock().commit_index >= log_id.index {
                break;
            }
            self.replicate().await?;
            if self.state.lock().commit_index >= log_id.index {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ConsensusError::Shutdown.into()),
                _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            }
        }

        // A new leader may have overwritten the slot before it committed.
        if self.log.term_at(log_id.index)? != Some(log_id.term)
            && self.state.lock().snapshot_index() < log_id.index
        {
            let leader_id = self.state.lock().leader_id.clone();
            return Err(ConsensusError::NotLeader { leader_id }.into());
        }

        self.wait_applied(log_id.index).await?;
        self.spawn_broadcast();
        Ok(log_id)
    }

    async fn wait_applied(
        &self,
        index: u64,
    ) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        loop {
            if rx.borrow_and_update().index >= index {
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ConsensusError::Shutdown.into()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ConsensusError::Shutdown.into());
                    }
                }
            }
        }
    }

    /// Pushes the current commit index to followers without blocking the
    /// caller
    fn spawn_broadcast(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.replicate().await {
                trace!("broadcast skipped: {}", e);
            }
        });
    }

    /// One replication pass to every other member.
    async fn replicate(self: &Arc<Self>) -> Result<()> {
        let _guard = self.replication.lock().await;
        let (term, targets) = {
            let st = self.state.lock();
            self.ensure_leader(&st)?;
            let targets: Vec<NodeId> = st
                .membership
                .servers()
                .filter(|s| s.id != self.id)
                .map(|s| s.id.clone())
                .collect();
            (st.hard_state.current_term, targets)
        };

        join_all(targets.iter().map(|peer| self.replicate_to(peer, term))).await;

        let mut st = self.state.lock();
        self.advance_commit(&mut st);
        Ok(())
    }

    async fn replicate_to(
        &self,
        peer: &str,
        term: u64,
    ) {
        for _ in 0..MAX_ROUNDS_PER_PEER {
            let request = match self.build_append_request(peer, term) {
                Ok(Some(req)) => req,
                Ok(None) => {
                    if !self.send_snapshot(peer, term).await {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    debug!("stop replicating to {}: {}", peer, e);
                    return;
                }
            };
            let prev_index = request.prev_log_id.index;
            let sent = request.entries.len() as u64;

            let response = match self.transport.append_entries(peer, request).await {
                Ok(r) => r,
                Err(e) => {
                    trace!("append_entries to {} failed: {}", peer, e);
                    return;
                }
            };

            let mut st = self.state.lock();
            if response.term > term {
                info!("peer {} has higher term {}", peer, response.term);
                if let Err(e) = self.become_follower(&mut st, response.term, None) {
                    error!("persist hard state: {}", e);
                }
                return;
            }
            if st.role != Role::Leader || st.hard_state.current_term != term {
                return;
            }

            if response.success {
                let matched = prev_index + sent;
                st.match_index.insert(peer.to_string(), matched);
                st.next_index.insert(peer.to_string(), matched + 1);
                if matched >= st.last_log_id.index {
                    return;
                }
            } else {
                let next = st.next_index.get(peer).copied().unwrap_or(1);
                let backoff = next.saturating_sub(1).min(response.last_log_index + 1).max(1);
                trace!("peer {} rejected at {}, retry from {}", peer, prev_index, backoff);
                st.next_index.insert(peer.to_string(), backoff);
            }
        }
    }

    /// `Ok(None)` when the entries the peer needs were compacted away
    fn build_append_request(
        &self,
        peer: &str,
        term: u64,
    ) -> Result<Option<AppendEntriesRequest>> {
        let mut st = self.state.lock();
        if st.role != Role::Leader || st.hard_state.current_term != term {
            return Err(ConsensusError::NotLeader {
                leader_id: st.leader_id.clone(),
            }
            .into());
        }
        let last = st.last_log_id.index;
        let next = *st.next_index.entry(peer.to_string()).or_insert(last + 1);
        let prev_index = next - 1;
        let snapshot_index = st.snapshot_index();
        if next <= snapshot_index && self.log.first_index()?.map_or(true, |first| first > next) {
            return Ok(None);
        }

        let prev_term = if prev_index == 0 {
            0
        } else if prev_index == snapshot_index {
            st.snapshot_meta.as_ref().map(|m| m.last_included.term).unwrap_or(0)
        } else {
            match self.log.term_at(prev_index)? {
                Some(t) => t,
                None if prev_index < snapshot_index => return Ok(None),
                None => {
                    st.next_index.insert(peer.to_string(), last + 1);
                    return Err(Error::Fatal(format!("missing log entry {}", prev_index)));
                }
            }
        };

        let entries = self.log.entries(next, last, self.config.max_append_entries)?;
        Ok(Some(AppendEntriesRequest {
            term,
            leader_id: self.id.clone(),
            prev_log_id: LogId::new(prev_term, prev_index),
            entries,
            leader_commit: st.commit_index,
        }))
    }

    /// Returns true when the peer accepted the snapshot
    async fn send_snapshot(
        &self,
        peer: &str,
        term: u64,
    ) -> bool {
        let snapshot = match self.state_storage.load_snapshot() {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!("no snapshot to send to {}", peer);
                return false;
            }
            Err(e) => {
                error!("load snapshot: {}", e);
                return false;
            }
        };
        let last_included = snapshot.meta.last_included;
        info!("sending snapshot {} to {}", last_included, peer);

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.id.clone(),
            snapshot,
        };
        match self.transport.install_snapshot(peer, request).await {
            Ok(resp) => {
                let mut st = self.state.lock();
                if resp.term > term {
                    if let Err(e) = self.become_follower(&mut st, resp.term, None) {
                        error!("persist hard state: {}", e);
                    }
                    return false;
                }
                st.match_index.insert(peer.to_string(), last_included.index);
                st.next_index.insert(peer.to_string(), last_included.index + 1);
                true
            }
            Err(e) => {
                debug!("install_snapshot to {} failed: {}", peer, e);
                false
            }
        }
    }

    /// Commits the highest index stored on a majority of voters, provided it
    /// belongs to the current term.
    fn advance_commit(
        &self,
        st: &mut RaftState,
    ) {
        if st.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = st
            .membership
            .voters()
            .map(|v| {
                if v.id == self.id {
                    st.last_log_id.index
                } else {
                    st.match_index.get(&v.id).copied().unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[majority_count(matched.len()) - 1];
        if candidate <= st.commit_index {
            return;
        }

        match self.log.term_at(candidate) {
            Ok(Some(t)) if t == st.hard_state.current_term => {
                trace!("commit index {} -> {}", st.commit_index, candidate);
                st.commit_index = candidate;
                self.commit_tx.send_replace(candidate);
            }
            Ok(_) => {}
            Err(e) => error!("read term at {}: {}", candidate, e),
        }
    }

    fn become_follower(
        &self,
        st: &mut RaftState,
        term: u64,
        leader_id: Option<NodeId>,
    ) -> Result<()> {
        if term > st.hard_state.current_term {
            st.hard_state = HardState {
                current_term: term,
                voted_for: None,
            };
            self.state_storage.save_hard_state(&st.hard_state)?;
        }
        if st.role == Role::Leader {
            info!(node_id = %self.id, term, "stepping down");
            IS_LEADER.with_label_values(&[&self.id]).set(0);
        }
        st.role = Role::Follower;
        st.leader_id = leader_id;
        st.election_timeout = random_election_timeout(&self.config);
        Ok(())
    }

    async fn campaign(self: &Arc<Self>) -> Result<()> {
        let (term, last_log_id, voters) = {
            let mut st = self.state.lock();
            if self.shutdown.is_cancelled() {
                return Err(ConsensusError::Shutdown.into());
            }
            if !st.membership.is_voter(&self.id) {
                return Err(ConsensusError::Membership(format!("{} is not a voter", self.id)).into());
            }
            if st.role == Role::Leader {
                return Ok(());
            }
            let term = st.hard_state.current_term + 1;
            st.hard_state = HardState {
                current_term: term,
                voted_for: Some(self.id.clone()),
            };
            self.state_storage.save_hard_state(&st.hard_state)?;
            st.role = Role::Candidate;
            st.leader_id = None;
            st.last_contact = Instant::now();
            st.election_timeout = random_election_timeout(&self.config);

            let voters: Vec<NodeId> = st
                .membership
                .voters()
                .filter(|s| s.id != self.id)
                .map(|s| s.id.clone())
                .collect();
            (term, st.last_log_id, voters)
        };
        debug!(node_id = %self.id, term, "campaigning");

        let request = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_id,
        };
        let responses = join_all(
            voters
                .iter()
                .map(|peer| self.transport.request_vote(peer, request.clone())),
        )
        .await;

        let mut granted = 1;
        for (peer, response) in voters.iter().zip(responses) {
            match response {
                Ok(resp) if resp.term > term => {
                    let mut st = self.state.lock();
                    self.become_follower(&mut st, resp.term, None)?;
                    return Err(ConsensusError::HigherTerm(resp.term).into());
                }
                Ok(resp) if resp.vote_granted => granted += 1,
                Ok(_) => trace!("{} denied vote", peer),
                Err(e) => trace!("request_vote to {} failed: {}", peer, e),
            }
        }

        let total = voters.len() + 1;
        if !is_majority(granted, total) {
            let mut st = self.state.lock();
            if st.role == Role::Candidate && st.hard_state.current_term == term {
                st.role = Role::Follower;
            }
            return Err(ConsensusError::QuorumNotReached {
                required: majority_count(total),
                succeed: granted,
            }
            .into());
        }

        self.become_leader(term)?;
        self.spawn_broadcast();
        Ok(())
    }

    fn become_leader(
        &self,
        term: u64,
    ) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.role != Role::Candidate || st.hard_state.current_term != term {
                return Err(ConsensusError::NotLeader {
                    leader_id: st.leader_id.clone(),
                }
                .into());
            }
            st.role = Role::Leader;
            st.leader_id = Some(self.id.clone());
            let next = st.last_log_id.index + 1;
            let peers: Vec<NodeId> = st.membership.servers().map(|s| s.id.clone()).collect();
            st.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
            st.match_index = peers.into_iter().map(|p| (p, 0)).collect();
        }
        info!(node_id = %self.id, term, "became leader");
        IS_LEADER.with_label_values(&[&self.id]).set(1);

        self.append_local(EntryPayload::Noop)?;
        Ok(())
    }

    async fn run_apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            if let Err(e) = self.apply_committed() {
                error!(node_id = %self.id, "apply committed entries: {}", e);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("apply loop stopped");
                    return;
                }
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn apply_committed(&self) -> Result<()> {
        loop {
            let commit = *self.commit_tx.borrow();
            let applied = self.state_machine.last_applied();
            if applied.index >= commit {
                break;
            }
            let entries = self.log.entries(applied.index + 1, commit, self.config.max_append_entries)?;
            if entries.is_empty() {
                return Err(Error::Fatal(format!(
                    "committed entries {}..={} missing from log",
                    applied.index + 1,
                    commit
                )));
            }

            let count = entries.len();
            let last_config = entries.iter().rev().find_map(|e| match &e.payload {
                EntryPayload::Config(m) => Some(m.clone()),
                _ => None,
            });
            self.state_machine.apply_chunk(entries)?;
            if let Some(m) = last_config {
                *self.applied_membership.lock() = m;
            }
            APPLIED_ENTRIES.inc_by(count as u64);
            self.applied_tx.send_replace(self.state_machine.last_applied());
        }
        self.maybe_snapshot()
    }

    fn maybe_snapshot(&self) -> Result<()> {
        let snapshot_index = self.state.lock().snapshot_index();
        let applied = self.state_machine.last_applied();
        if applied.index.saturating_sub(snapshot_index) < self.config.snapshot_threshold {
            return Ok(());
        }

        let (last_included, data) = self.state_machine.snapshot_data()?;
        let meta = SnapshotMeta {
            last_included,
            membership: self.applied_membership.lock().clone(),
        };
        self.state_storage.save_snapshot(&Snapshot {
            meta: meta.clone(),
            data,
        })?;

        let purge_upto = last_included.index.saturating_sub(self.config.trailing_logs);
        {
            let mut st = self.state.lock();
            st.snapshot_meta = Some(meta);
            if purge_upto > 0 {
                self.log.purge(purge_upto)?;
            }
        }
        info!(node_id = %self.id, "snapshot taken at {}", last_included);
        Ok(())
    }

    async fn run_timer_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            }

            let (role, expired, voter) = {
                let st = self.state.lock();
                (
                    st.role,
                    st.last_contact.elapsed() >= st.election_timeout,
                    st.membership.is_voter(&self.id),
                )
            };

            match role {
                Role::Leader => {
                    if let Err(e) = self.replicate().await {
                        trace!("heartbeat skipped: {}", e);
                    }
                }
                _ if expired && voter => {
                    if let Err(e) = self.campaign().await {
                        debug!(node_id = %self.id, "election failed: {}", e);
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl RaftHandler for RaftInner {
    async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut st = self.state.lock();
        let term = st.hard_state.current_term;
        if req.term < term {
            return Ok(AppendEntriesResponse {
                term,
                success: false,
                last_log_index: st.last_log_id.index,
            });
        }
        if req.term > term || st.role != Role::Follower {
            self.become_follower(&mut st, req.term, None)?;
        }
        st.leader_id = Some(req.leader_id.clone());
        st.last_contact = Instant::now();

        let prev = req.prev_log_id;
        let snapshot_index = st.snapshot_index();
        if prev.index > st.last_log_id.index {
            return Ok(AppendEntriesResponse {
                term: req.term,
                success: false,
                last_log_index: st.last_log_id.index,
            });
        }
        if prev.index > snapshot_index {
            if self.log.term_at(prev.index)? != Some(prev.term) {
                return Ok(AppendEntriesResponse {
                    term: req.term,
                    success: false,
                    last_log_index: prev.index - 1,
                });
            }
        } else if prev.index == snapshot_index && prev.index > 0 {
            let snapshot_term = st.snapshot_meta.as_ref().map(|m| m.last_included.term);
            if snapshot_term != Some(prev.term) {
                return Ok(AppendEntriesResponse {
                    term: req.term,
                    success: false,
                    last_log_index: prev.index.saturating_sub(1),
                });
            }
        }

        let last_new = prev.index + req.entries.len() as u64;
        let mut to_append = Vec::new();
        let mut truncated = false;
        for entry in req.entries {
            if entry.index() <= snapshot_index {
                continue;
            }
            if to_append.is_empty() && entry.index() <= st.last_log_id.index {
                match self.log.term_at(entry.index())? {
                    Some(t) if t == entry.term() => continue,
                    _ => {
                        if entry.index() <= st.commit_index {
                            return Err(Error::Fatal(format!(
                                "leader {} conflicts with committed entry {}",
                                req.leader_id,
                                entry.index()
                            )));
                        }
                        self.log.truncate(entry.index())?;
                        truncated = true;
                    }
                }
            }
            to_append.push(entry);
        }

        if truncated {
            st.last_log_id = match self.log.last_log_id()? {
                Some(id) => id,
                None => st.snapshot_meta.as_ref().map(|m| m.last_included).unwrap_or_default(),
            };
            st.membership = match self.log.last_membership()? {
                Some((_, m)) => m,
                None => st
                    .snapshot_meta
                    .as_ref()
                    .map(|m| m.membership.clone())
                    .unwrap_or_default(),
            };
        }

        if let Some(last) = to_append.last() {
            self.log.append(&to_append)?;
            st.last_log_id = last.log_id;
            if let Some(m) = to_append.iter().rev().find_map(|e| match &e.payload {
                EntryPayload::Config(m) => Some(m.clone()),
                _ => None,
            }) {
                st.membership = m;
            }
        }

        let commit = req.leader_commit.min(last_new);
        if commit > st.commit_index {
            st.commit_index = commit;
            self.commit_tx.send_replace(commit);
        }

        Ok(AppendEntriesResponse {
            term: req.term,
            success: true,
            last_log_index: st.last_log_id.index,
        })
    }

    async fn handle_request_vote(
        &self,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        let mut st = self.state.lock();
        let term = st.hard_state.current_term;
        let deny = |term: u64| -> Result<VoteResponse> {
            Ok(VoteResponse {
                term,
                vote_granted: false,
            })
        };

        if req.term < term {
            return deny(term);
        }
        if req.term > term {
            // Leader stickiness: a live leader keeps removed or partitioned
            // nodes from forcing a new term.
            let live_leader = match st.role {
                Role::Leader => !st.membership.contains(&req.candidate_id),
                Role::Follower => {
                    st.leader_id.is_some()
                        && st.last_contact.elapsed()
                            < Duration::from_millis(self.config.election_timeout_min_ms)
                }
                Role::Candidate => false,
            };
            if live_leader {
                trace!("ignore vote request from {} while leader is live", req.candidate_id);
                return deny(term);
            }
            self.become_follower(&mut st, req.term, None)?;
        }

        let can_vote = match &st.hard_state.voted_for {
            None => true,
            Some(v) => v == &req.candidate_id,
        };
        if !can_vote || req.last_log_id < st.last_log_id {
            return deny(req.term);
        }

        st.hard_state.voted_for = Some(req.candidate_id.clone());
        self.state_storage.save_hard_state(&st.hard_state)?;
        st.last_contact = Instant::now();
        debug!(node_id = %self.id, "voted for {} in term {}", req.candidate_id, req.term);
        Ok(VoteResponse {
            term: req.term,
            vote_granted: true,
        })
    }

    async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut st = self.state.lock();
        let term = st.hard_state.current_term;
        if req.term < term {
            return Ok(InstallSnapshotResponse { term });
        }
        if req.term > term || st.role != Role::Follower {
            self.become_follower(&mut st, req.term, None)?;
        }
        st.leader_id = Some(req.leader_id.clone());
        st.last_contact = Instant::now();

        let meta = req.snapshot.meta.clone();
        if meta.last_included.index <= st.commit_index {
            debug!("ignore stale snapshot {}", meta.last_included);
            return Ok(InstallSnapshotResponse { term: req.term });
        }

        info!(node_id = %self.id, "installing snapshot {}", meta.last_included);
        self.state_machine
            .apply_snapshot(meta.last_included, &req.snapshot.data)?;
        self.state_storage.save_snapshot(&req.snapshot)?;
        self.log.reset()?;

        *self.applied_membership.lock() = meta.membership.clone();
        st.membership = meta.membership.clone();
        st.last_log_id = meta.last_included;
        st.commit_index = meta.last_included.index;
        st.snapshot_meta = Some(meta);
        self.commit_tx.send_replace(st.commit_index);
        self.applied_tx.send_replace(self.state_machine.last_applied());

        Ok(InstallSnapshotResponse { term: req.term })
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let ms = rand::thread_rng().gen_range(config.election_timeout_min_ms..config.election_timeout_max_ms);
    Duration::from_millis(ms)
}
