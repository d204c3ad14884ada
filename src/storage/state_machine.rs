//! StateMachine
//!
//! Applies committed log entries to the mesh key space and serializes it
//! for snapshots. Reads go straight to the data tree and may run while an
//! apply is in flight; applies are serialized by an internal lock.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::constants::STATE_MACHINE_META_KEY_LAST_APPLIED;
use crate::consensus::Entry;
use crate::consensus::EntryPayload;
use crate::consensus::LogId;
use crate::storage::BatchOp;
use crate::storage::Command;
use crate::storage::KvPair;
use crate::storage::Tree;
use crate::Result;
use crate::StorageError;

#[cfg_attr(test, automock)]
pub trait StateMachine: Send + Sync + 'static {
    fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>;

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KvPair>>;

    /// Applies entries in index order. Entries at or below
    /// [`StateMachine::last_applied`] are skipped.
    fn apply_chunk(
        &self,
        chunk: Vec<Entry>,
    ) -> Result<()>;

    fn last_applied(&self) -> LogId;

    /// Full contents as of [`StateMachine::last_applied`]
    fn snapshot_data(&self) -> Result<(LogId, Vec<u8>)>;

    /// Replaces the whole state with a snapshot taken at `last_included`
    fn apply_snapshot(
        &self,
        last_included: LogId,
        data: &[u8],
    ) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&self) -> Result<()>;
}

pub struct MeshStateMachine {
    data: Arc<dyn Tree>,
    meta: Arc<dyn Tree>,
    /// Serialization point for applies and snapshot installs
    last_applied: Mutex<LogId>,
}

impl MeshStateMachine {
    pub fn new(
        data: Arc<dyn Tree>,
        meta: Arc<dyn Tree>,
    ) -> Result<Self> {
        let last_applied = match meta.get(STATE_MACHINE_META_KEY_LAST_APPLIED.as_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => LogId::default(),
        };
        debug!("state machine opened at last_applied={}", last_applied);
        Ok(Self {
            data,
            meta,
            last_applied: Mutex::new(last_applied),
        })
    }

    fn persist_last_applied(
        &self,
        id: LogId,
    ) -> Result<()> {
        self.meta
            .insert(STATE_MACHINE_META_KEY_LAST_APPLIED.as_bytes(), &bincode::serialize(&id)?)
    }
}

impl StateMachine for MeshStateMachine {
    fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.data.get(key)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KvPair>> {
        self.data.scan_prefix(prefix)
    }

    fn apply_chunk(
        &self,
        chunk: Vec<Entry>,
    ) -> Result<()> {
        let mut last_applied = self.last_applied.lock();
        let mut ops = Vec::new();
        let mut highest = *last_applied;

        for entry in chunk {
            if entry.index() <= highest.index {
                trace!("skip already applied entry {}", entry.log_id);
                continue;
            }
            if entry.index() != highest.index + 1 {
                error!(
                    "apply gap: expected index {}, got {}",
                    highest.index + 1,
                    entry.index()
                );
                return Err(StorageError::StateMachineError(format!(
                    "non-contiguous apply at {}",
                    entry.log_id
                ))
                .into());
            }

            if let EntryPayload::Command(bytes) = &entry.payload {
                match Command::decode(bytes)? {
                    Command::Put { key, value } => ops.push(BatchOp::Insert(key.into_bytes(), value)),
                    Command::Delete { key } => ops.push(BatchOp::Remove(key.into_bytes())),
                }
            }
            highest = entry.log_id;
        }

        if highest == *last_applied {
            return Ok(());
        }

        self.data.apply_batch(ops)?;
        self.persist_last_applied(highest)?;
        trace!("applied up to {}", highest);
        *last_applied = highest;
        Ok(())
    }

    fn last_applied(&self) -> LogId {
        *self.last_applied.lock()
    }

    fn snapshot_data(&self) -> Result<(LogId, Vec<u8>)> {
        let last_applied = self.last_applied.lock();
        let pairs = self.data.scan_prefix(&[])?;
        Ok((*last_applied, bincode::serialize(&pairs)?))
    }

    fn apply_snapshot(
        &self,
        last_included: LogId,
        data: &[u8],
    ) -> Result<()> {
        let pairs: Vec<KvPair> = bincode::deserialize(data)?;
        let mut last_applied = self.last_applied.lock();

        self.data.clear()?;
        self.data.apply_batch(pairs.into_iter().map(|(k, v)| BatchOp::Insert(k, v)).collect())?;
        self.persist_last_applied(last_included)?;
        debug!("installed snapshot at {}", last_included);
        *last_applied = last_included;
        Ok(())
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn flush(&self) -> Result<()> {
        self.data.flush()?;
        self.meta.flush()
    }
}
