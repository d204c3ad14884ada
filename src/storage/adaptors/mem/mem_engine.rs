use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::storage::BatchOp;
use crate::storage::KvPair;
use crate::storage::StorageEngine;
use crate::storage::Tree;
use crate::Result;

/// In-memory tree
#[derive(Debug, Default)]
pub struct MemoryTree {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

/// Ephemeral engine; every tree lives in process memory
#[derive(Debug, Default)]
pub struct MemoryEngine {
    trees: DashMap<String, Arc<MemoryTree>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    fn open_tree(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Tree>> {
        let tree = self
            .trees
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("open in-memory tree {}", name);
                Arc::new(MemoryTree::default())
            })
            .clone();
        Ok(tree)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Tree for MemoryTree {
    fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn insert(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(
        &self,
        key: &[u8],
    ) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KvPair>> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn range(
        &self,
        start: &[u8],
        end: Option<Vec<u8>>,
    ) -> Result<Vec<KvPair>> {
        let data = self.data.read();
        let upper = match &end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        Ok(data
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn first(&self) -> Result<Option<KvPair>> {
        Ok(self.data.read().iter().next().map(|(k, v)| (k.clone(), v.clone())))
    }

    fn last(&self) -> Result<Option<KvPair>> {
        Ok(self.data.read().iter().next_back().map(|(k, v)| (k.clone(), v.clone())))
    }

    fn apply_batch(
        &self,
        ops: Vec<BatchOp>,
    ) -> Result<()> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Insert(k, v) => {
                    data.insert(k, v);
                }
                BatchOp::Remove(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }
}
