use std::sync::Arc;

use tonic::async_trait;

use super::*;
use crate::Error;
use crate::NetworkError;
use crate::Result;
use crate::SystemError;

/// Answers every RPC with its own term so tests can tell nodes apart
struct EchoHandler {
    term: u64,
}

#[async_trait]
impl RaftHandler for EchoHandler {
    async fn handle_append_entries(
        &self,
        _req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        Ok(AppendEntriesResponse {
            term: self.term,
            success: true,
            last_log_index: 0,
        })
    }

    async fn handle_request_vote(
        &self,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        Ok(VoteResponse {
            term: self.term,
            vote_granted: req.term >= self.term,
        })
    }

    async fn handle_install_snapshot(
        &self,
        _req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        Ok(InstallSnapshotResponse { term: self.term })
    }
}

fn vote(term: u64) -> VoteRequest {
    VoteRequest {
        term,
        candidate_id: "a".into(),
        last_log_id: LogId::default(),
    }
}

fn is_unreachable(err: &Error) -> bool {
    matches!(
        err,
        Error::System(SystemError::Network(NetworkError::Unreachable { .. }))
    )
}

fn register(
    network: &Arc<LocalNetwork>,
    id: &str,
    term: u64,
) -> Arc<EchoHandler> {
    let handler = Arc::new(EchoHandler { term });
    let as_dyn: Arc<dyn RaftHandler> = handler.clone();
    network.register(id, Arc::downgrade(&as_dyn));
    handler
}

#[tokio::test]
async fn requests_should_reach_the_registered_target() {
    let network = LocalNetwork::new();
    let _b = register(&network, "b", 3);
    let _c = register(&network, "c", 5);
    let transport = network.transport("a");

    assert_eq!(transport.request_vote("b", vote(4)).await.unwrap().term, 3);
    let resp = transport.request_vote("c", vote(4)).await.unwrap();
    assert_eq!(resp.term, 5);
    assert!(!resp.vote_granted);
}

#[tokio::test]
async fn unknown_or_dropped_target_should_be_unreachable() {
    let network = LocalNetwork::new();
    let transport = network.transport("a");
    assert!(is_unreachable(&transport.request_vote("nobody", vote(1)).await.unwrap_err()));

    let b = register(&network, "b", 1);
    drop(b);
    assert!(is_unreachable(&transport.request_vote("b", vote(1)).await.unwrap_err()));
}

/// # Case 1: isolation cuts both directions until restored
#[tokio::test]
async fn isolated_node_should_neither_send_nor_receive() {
    let network = LocalNetwork::new();
    let _a = register(&network, "a", 1);
    let _b = register(&network, "b", 1);
    let from_a = network.transport("a");
    let from_b = network.transport("b");

    network.isolate("a");
    assert!(is_unreachable(&from_a.request_vote("b", vote(1)).await.unwrap_err()));
    assert!(is_unreachable(&from_b.request_vote("a", vote(1)).await.unwrap_err()));

    network.restore("a");
    from_a.request_vote("b", vote(1)).await.unwrap();
    from_b.request_vote("a", vote(1)).await.unwrap();

    network.deregister("b");
    assert!(is_unreachable(&from_a.request_vote("b", vote(1)).await.unwrap_err()));
}

#[test]
fn unreachable_should_map_to_unavailable() {
    let err: Error = NetworkError::Unreachable { node_id: "x".into() }.into();
    assert_eq!(err.code(), tonic::Code::Unavailable);
}
