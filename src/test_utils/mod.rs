//! Fixtures shared by unit tests: in-memory state machines, a consensus mock
//! that applies directly, and in-process raft clusters.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RaftConfig;
use crate::consensus::Consensus;
use crate::consensus::Entry;
use crate::consensus::EntryPayload;
use crate::consensus::LocalNetwork;
use crate::consensus::LogId;
use crate::consensus::MockConsensus;
use crate::consensus::Raft;
use crate::consensus::Server;
use crate::constants::STATE_MACHINE_META_TREE;
use crate::constants::STATE_MACHINE_TREE;
use crate::storage::MemoryEngine;
use crate::storage::MeshStateMachine;
use crate::storage::MeshStorage;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;
use crate::storage::StorageEngine;

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn state_machine_on(engine: &dyn StorageEngine) -> Arc<MeshStateMachine> {
    Arc::new(
        MeshStateMachine::new(
            engine.open_tree(STATE_MACHINE_TREE).unwrap(),
            engine.open_tree(STATE_MACHINE_META_TREE).unwrap(),
        )
        .unwrap(),
    )
}

pub(crate) fn mem_state_machine() -> Arc<MeshStateMachine> {
    state_machine_on(&MemoryEngine::new())
}

/// Consensus that applies every command straight to `sm`, like a
/// single-node leader would.
pub(crate) fn applying_consensus(sm: Arc<MeshStateMachine>) -> MockConsensus {
    let mut consensus = MockConsensus::new();
    consensus.expect_apply().returning(move |command, _| {
        let log_id = LogId::new(1, sm.last_applied().index + 1);
        sm.apply_chunk(vec![Entry {
            log_id,
            payload: EntryPayload::Command(command),
        }])?;
        Ok(log_id)
    });
    consensus
}

/// Mesh storage over a fresh in-memory state machine
pub(crate) fn mem_mesh_storage() -> Arc<dyn MeshStorage> {
    let sm = mem_state_machine();
    Arc::new(RaftStorage::new(
        Arc::new(applying_consensus(sm.clone())),
        sm,
        TEST_TIMEOUT,
    ))
}

/// Fast timers; elections only happen through `campaign()`.
pub(crate) fn test_raft_config() -> RaftConfig {
    RaftConfig {
        apply_timeout_ms: 5_000,
        barrier_timeout_ms: 5_000,
        heartbeat_interval_ms: 20,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        auto_campaign: false,
        ..Default::default()
    }
}

pub(crate) struct TestNode {
    pub id: String,
    pub raft: Raft,
    pub state_machine: Arc<MeshStateMachine>,
}

impl TestNode {
    pub fn storage(&self) -> Arc<dyn MeshStorage> {
        Arc::new(RaftStorage::new(
            Arc::new(self.raft.clone()),
            self.state_machine.clone(),
            TEST_TIMEOUT,
        ))
    }
}

/// Raft nodes wired through one [`LocalNetwork`]
pub(crate) struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Creates, registers and starts a node without any cluster state
    pub fn spawn_node(
        &mut self,
        id: &str,
        config: RaftConfig,
        engine: &dyn StorageEngine,
    ) -> &TestNode {
        let state_machine = state_machine_on(engine);
        let raft = Raft::new(
            id,
            format!("{}:8443", id),
            config,
            engine,
            state_machine.clone(),
            Arc::new(self.network.transport(id)),
        )
        .unwrap();
        self.network.register(id, raft.handler());
        raft.start();
        self.nodes.push(TestNode {
            id: id.to_string(),
            raft,
            state_machine,
        });
        self.nodes.last().unwrap()
    }

    /// Bootstraps the first node as leader and adds the rest as voters.
    pub async fn start_voters(
        ids: &[&str],
        config: RaftConfig,
    ) -> Self {
        let mut cluster = Self::new();
        for id in ids {
            cluster.spawn_node(id, config.clone(), &MemoryEngine::new());
        }
        let leader = &cluster.nodes[0].raft;
        assert!(leader.bootstrap().unwrap());
        leader.campaign().await.unwrap();
        for id in &ids[1..] {
            leader
                .add_server(Server::voter(*id, format!("{}:8443", id)), TEST_TIMEOUT)
                .await
                .unwrap();
        }
        cluster
    }

    pub fn node(
        &self,
        id: &str,
    ) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// Polls until every node applied at least `index`
    pub async fn wait_applied(
        &self,
        index: u64,
    ) {
        for node in &self.nodes {
            wait_until(|| node.raft.last_applied().index >= index).await;
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.raft.shutdown().await.unwrap();
        }
    }
}

/// Polls `cond` every 10ms, panicking after [`TEST_TIMEOUT`]
pub(crate) async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Opens a query channel for `plugin` against `storage` and injects the
/// plugin side, like the plugin manager does on registration.
pub(crate) async fn connect_plugin(
    plugin: &dyn crate::plugins::Plugin,
    name: &str,
    storage: Arc<dyn MeshStorage>,
    writable: bool,
) -> tokio_util::sync::CancellationToken {
    let cancel = tokio_util::sync::CancellationToken::new();
    let (stream, db) = crate::plugins::query_channel(name);
    let session = crate::plugins::QuerySession::new(name, storage, writable, cancel.clone());
    tokio::spawn(session.serve(stream));
    plugin.inject_querier(db).await.unwrap();
    cancel
}

/// Bootstrapped single-node leader with mesh settings written and the
/// built-in IPAM plugin registered.
pub(crate) struct MeshFixture {
    pub cluster: TestCluster,
    pub consensus: Arc<dyn Consensus>,
    pub db: crate::meshdb::MeshDb,
    pub plugins: Arc<crate::plugins::PluginManager>,
}

impl MeshFixture {
    pub const LEADER: &'static str = "leader";

    pub async fn new(
        ipv4_prefix: &str,
        ipv6_prefix: Option<&str>,
    ) -> Self {
        let cluster = TestCluster::start_voters(&[Self::LEADER], test_raft_config()).await;
        let storage = cluster.node(Self::LEADER).storage();
        let consensus: Arc<dyn Consensus> = Arc::new(cluster.node(Self::LEADER).raft.clone());
        let db = crate::meshdb::MeshDb::new(storage.clone());

        let state = db.state();
        state.set_ipv4_prefix(&ipv4_prefix.parse().unwrap()).await.unwrap();
        if let Some(v6) = ipv6_prefix {
            state.set_ipv6_prefix(&v6.parse().unwrap()).await.unwrap();
        }
        state.set_mesh_domain("mesh.test").await.unwrap();

        let plugins = Arc::new(crate::plugins::PluginManager::new(storage));
        plugins
            .register(
                crate::constants::BUILTIN_IPAM_PLUGIN,
                Arc::new(crate::plugins::builtins::IpamPlugin::new()),
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        Self {
            cluster,
            consensus,
            db,
            plugins,
        }
    }

    pub fn membership(
        &self,
        rbac: Arc<dyn crate::services::RbacEvaluator>,
    ) -> crate::services::MembershipService {
        crate::services::MembershipService::new(
            self.consensus.clone(),
            self.db.clone(),
            self.plugins.clone(),
            rbac,
            TEST_TIMEOUT,
            TEST_TIMEOUT,
        )
    }

    pub fn admin(
        &self,
        rbac: Arc<dyn crate::services::RbacEvaluator>,
    ) -> crate::services::AdminService {
        crate::services::AdminService::new(self.consensus.clone(), self.db.clone(), rbac)
    }
}

/// Consensus mock of a follower that knows `leader`
pub(crate) fn follower_consensus(
    id: &str,
    leader: Option<&str>,
) -> MockConsensus {
    let mut consensus = MockConsensus::new();
    consensus.expect_id().return_const(id.to_string());
    consensus.expect_is_leader().return_const(false);
    let leader = leader.map(|l| Server::voter(l, format!("{}:8443", l)));
    consensus.expect_leader().returning(move || {
        leader
            .clone()
            .ok_or_else(|| crate::ConsensusError::NoLeader.into())
    });
    consensus
}

/// In-memory, insecure node settings with fast raft timers
pub(crate) fn node_settings(id: &str) -> crate::config::Settings {
    let mut settings = crate::config::Settings::default();
    settings.node.id = id.to_string();
    settings.node.advertise_address = "127.0.0.1:8443".to_string();
    settings.node.public_key = format!("{}-key", id);
    settings.node.in_memory = true;
    settings.raft = test_raft_config();
    settings.services.secure = false;
    settings.mesh.ipv4_prefix = "10.42.0.0/16".to_string();
    settings
}
