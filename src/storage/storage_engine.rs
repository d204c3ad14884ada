use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Key/value pair as stored in a [`Tree`]
pub type KvPair = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Insert(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

/// Ordered byte map. All scans return entries in key order.
#[cfg_attr(test, automock)]
pub trait Tree: Send + Sync + 'static {
    fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>;

    fn insert(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<()>;

    fn remove(
        &self,
        key: &[u8],
    ) -> Result<()>;

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KvPair>>;

    /// Entries with `start <= key < end`; `None` means unbounded
    fn range(
        &self,
        start: &[u8],
        end: Option<Vec<u8>>,
    ) -> Result<Vec<KvPair>>;

    fn first(&self) -> Result<Option<KvPair>>;

    fn last(&self) -> Result<Option<KvPair>>;

    /// Applies all operations atomically
    fn apply_batch(
        &self,
        ops: Vec<BatchOp>,
    ) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens named trees. One engine backs the log, the raft state and the
/// state machine of a node.
pub trait StorageEngine: Send + Sync + 'static {
    fn open_tree(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Tree>>;

    fn flush(&self) -> Result<()>;
}
