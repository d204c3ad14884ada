use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tonic::async_trait;
use tracing::debug;
use tracing::trace;

use crate::consensus::Consensus;
use crate::storage::Command;
use crate::storage::StateMachine;
use crate::Error;
use crate::Result;

/// Callback of [`MeshStorage::iter_prefix`]. Returning an error stops the
/// iteration and is passed back to the caller.
pub type PrefixVisitor<'a> = &'a mut (dyn FnMut(&str, &[u8]) -> Result<()> + Send);

/// Key/value view of the mesh database shared by the RPC path and plugins.
#[async_trait]
pub trait MeshStorage: Send + Sync + 'static {
    /// # Errors
    /// `Error::NotFound` when the key is absent
    async fn get_value(
        &self,
        key: &str,
    ) -> Result<Vec<u8>>;

    async fn put_value(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Deleting an absent key succeeds
    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    /// Keys under `prefix`, in key order
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>>;

    async fn iter_prefix(
        &self,
        prefix: &str,
        visitor: PrefixVisitor<'_>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Reads from the local state machine, writes through consensus.
///
/// Reads on a follower may lag the leader.
pub struct RaftStorage {
    consensus: Arc<dyn Consensus>,
    state_machine: Arc<dyn StateMachine>,
    apply_timeout: Duration,
    closed: AtomicBool,
}

impl RaftStorage {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        state_machine: Arc<dyn StateMachine>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            state_machine,
            apply_timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FailedPrecondition("storage is closed".to_string()));
        }
        Ok(())
    }

    async fn apply(
        &self,
        command: Command,
    ) -> Result<()> {
        self.ensure_open()?;
        trace!("apply {:?}", command.key());
        let log_id = self.consensus.apply(command.encode()?, self.apply_timeout).await?;
        trace!("applied at {}", log_id);
        Ok(())
    }
}

#[async_trait]
impl MeshStorage for RaftStorage {
    async fn get_value(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.state_machine
            .get(key.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("key {}", key)))
    }

    async fn put_value(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        self.apply(Command::put(key, value)).await
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.apply(Command::delete(key)).await
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.state_machine
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(k, _)| key_to_string(k))
            .collect()
    }

    async fn iter_prefix(
        &self,
        prefix: &str,
        visitor: PrefixVisitor<'_>,
    ) -> Result<()> {
        self.ensure_open()?;
        for (k, v) in self.state_machine.scan_prefix(prefix.as_bytes())? {
            let key = key_to_string(k)?;
            visitor(&key, &v)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("closing raft storage");
        self.closed.store(true, Ordering::Release);
        self.state_machine.flush()
    }
}

fn key_to_string(key: Vec<u8>) -> Result<String> {
    String::from_utf8(key).map_err(|e| {
        crate::StorageError::DataCorruption {
            location: format!("non utf-8 key: {}", e),
        }
        .into()
    })
}
