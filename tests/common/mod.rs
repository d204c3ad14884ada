use std::sync::Arc;
use std::time::Duration;

use meshnode::config::RaftConfig;
use meshnode::config::Settings;
use meshnode::consensus::Consensus;
use meshnode::consensus::LocalNetwork;
use meshnode::node::Node;
use meshnode::node::NodeBuilder;
use meshnode::services::context::peer_request;
use meshnode::services::JoinRequest;
use meshnode::services::LocalDialer;
use meshnode::services::MeshApi;
use tracing::info;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn node_settings(id: &str) -> Settings {
    let mut settings = Settings::default();
    settings.node.id = id.to_string();
    settings.node.public_key = format!("{}-key", id);
    settings.node.advertise_address = "127.0.0.1:8443".to_string();
    settings.node.in_memory = true;
    settings.raft = RaftConfig {
        apply_timeout_ms: 5_000,
        barrier_timeout_ms: 5_000,
        heartbeat_interval_ms: 20,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        auto_campaign: false,
        ..Default::default()
    };
    settings.services.secure = true;
    settings.services.forward_timeout_ms = 5_000;
    settings
        .services
        .rbac
        .insert("ops".to_string(), vec!["*".to_string()]);
    settings.monitoring.metrics_enabled = false;
    settings.mesh.ipv4_prefix = "10.99.0.0/24".to_string();
    settings
}

/// In-process mesh: the first node bootstraps, the others join it as
/// consensus voters through its RPC surface.
pub struct TestMesh {
    pub network: Arc<LocalNetwork>,
    pub dialer: Arc<LocalDialer>,
    pub nodes: Vec<Node>,
}

impl TestMesh {
    pub async fn start(ids: &[&str]) -> Self {
        let network = LocalNetwork::new();
        let dialer = LocalDialer::new();
        let mut nodes = Vec::new();
        for id in ids {
            let node = NodeBuilder::new(node_settings(id))
                .network(network.clone())
                .dialer(dialer.clone())
                .build()
                .await
                .unwrap();
            nodes.push(node);
        }
        assert!(nodes[0].bootstrap().await.unwrap());

        let mesh = Self {
            network,
            dialer,
            nodes,
        };
        for id in &ids[1..] {
            let mut request = JoinRequest::new(*id, format!("{}-key", id));
            request.as_voter = true;
            request.assign_ipv4 = true;
            request.raft_address = Some(format!("{}:8443", id));
            mesh.leader()
                .api()
                .join(peer_request(id, request))
                .await
                .unwrap();
            info!("{} joined", id);
        }
        mesh.wait_caught_up().await;
        mesh
    }

    pub fn leader(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(
        &self,
        id: &str,
    ) -> &Node {
        self.nodes.iter().find(|n| n.id() == id).unwrap()
    }

    /// Waits until every node still in consensus applied what the leader
    /// has applied
    pub async fn wait_caught_up(&self) {
        let target = self.leader().consensus().last_applied().index;
        let members = self.leader().consensus().membership();
        for node in self.nodes.iter().filter(|n| members.contains(n.id())) {
            wait_until(|| node.consensus().last_applied().index >= target).await;
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await.unwrap();
        }
    }
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
