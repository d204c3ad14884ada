use std::sync::Arc;

use tracing::debug;
use tracing::trace;

use crate::consensus::Entry;
use crate::consensus::EntryPayload;
use crate::consensus::LogId;
use crate::consensus::Membership;
use crate::storage::BatchOp;
use crate::storage::Tree;
use crate::utils::convert::safe_kv;
use crate::utils::convert::safe_vk;
use crate::Error;
use crate::Result;

/// Persistent replicated log, keyed by big-endian index so tree order is
/// index order.
pub struct RaftLog {
    tree: Arc<dyn Tree>,
}

impl RaftLog {
    pub fn new(tree: Arc<dyn Tree>) -> Self {
        Self { tree }
    }

    pub fn append(
        &self,
        entries: &[Entry],
    ) -> Result<()> {
        trace!("append {} entries", entries.len());
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            ops.push(BatchOp::Insert(
                safe_kv(entry.index()).to_vec(),
                bincode::serialize(entry)?,
            ));
        }
        self.tree.apply_batch(ops)
    }

    pub fn entry(
        &self,
        index: u64,
    ) -> Result<Option<Entry>> {
        match self.tree.get(&safe_kv(index))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn term_at(
        &self,
        index: u64,
    ) -> Result<Option<u64>> {
        Ok(self.entry(index)?.map(|e| e.term()))
    }

    /// Entries in `[start, end]`, at most `limit` of them
    pub fn entries(
        &self,
        start: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(Vec::new());
        }
        let upper = end.checked_add(1).map(|e| safe_kv(e).to_vec());
        self.tree
            .range(&safe_kv(start), upper)?
            .into_iter()
            .take(limit)
            .map(|(_, v)| bincode::deserialize::<Entry>(&v).map_err(Error::from))
            .collect()
    }

    pub fn first_index(&self) -> Result<Option<u64>> {
        match self.tree.first()? {
            Some((k, _)) => Ok(Some(safe_vk(&k)?)),
            None => Ok(None),
        }
    }

    pub fn last_log_id(&self) -> Result<Option<LogId>> {
        match self.tree.last()? {
            Some((_, v)) => {
                let entry: Entry = bincode::deserialize(&v)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }

    /// Removes `from_index` and everything after it
    pub fn truncate(
        &self,
        from_index: u64,
    ) -> Result<()> {
        debug!("truncate log from {}", from_index);
        let ops = self
            .tree
            .range(&safe_kv(from_index), None)?
            .into_iter()
            .map(|(k, _)| BatchOp::Remove(k))
            .collect();
        self.tree.apply_batch(ops)
    }

    /// Removes everything up to and including `upto_index`
    pub fn purge(
        &self,
        upto_index: u64,
    ) -> Result<()> {
        let Some(end) = upto_index.checked_add(1) else {
            return self.tree.clear();
        };
        debug!("purge log up to {}", upto_index);
        let ops = self
            .tree
            .range(&safe_kv(0), Some(safe_kv(end).to_vec()))?
            .into_iter()
            .map(|(k, _)| BatchOp::Remove(k))
            .collect();
        self.tree.apply_batch(ops)
    }

    pub fn reset(&self) -> Result<()> {
        self.tree.clear()
    }

    /// Latest configuration entry still in the log
    pub fn last_membership(&self) -> Result<Option<(LogId, Membership)>> {
        self.last_membership_upto(u64::MAX)
    }

    /// Latest configuration entry at or below `upto_index`
    pub fn last_membership_upto(
        &self,
        upto_index: u64,
    ) -> Result<Option<(LogId, Membership)>> {
        let upper = upto_index.checked_add(1).map(|e| safe_kv(e).to_vec());
        let mut found = None;
        for (_, v) in self.tree.range(&safe_kv(0), upper)? {
            let entry: Entry = bincode::deserialize(&v)?;
            if let EntryPayload::Config(membership) = entry.payload {
                found = Some((entry.log_id, membership));
            }
        }
        Ok(found)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
