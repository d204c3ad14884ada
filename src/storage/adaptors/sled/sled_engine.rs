use std::path::Path;
use std::sync::Arc;

use sled::Batch;
use tracing::debug;
use tracing::warn;

use crate::storage::BatchOp;
use crate::storage::KvPair;
use crate::storage::StorageEngine;
use crate::storage::Tree;
use crate::Result;

/// On-disk engine: one sled database per node, one sled tree per namespace
#[derive(Debug, Clone)]
pub struct SledEngine {
    db: sled::Db,
}

/// sled tree adaptor
#[derive(Debug, Clone)]
pub struct SledTree {
    tree: sled::Tree,
}

impl SledEngine {
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        debug!("open sled storage engine at {:?}", &path);
        let db = init_sled_db(&path)?;
        Ok(Self { db })
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }
}

fn init_sled_db(path: impl AsRef<Path> + std::fmt::Debug) -> Result<sled::Db> {
    let db_path = path.as_ref().join("storage_engine");

    sled::Config::default()
        .path(&db_path)
        .cache_capacity(64 * 1024 * 1024) //64MB
        .flush_every_ms(Some(10))
        .use_compression(true)
        .compression_factor(1)
        .open()
        .map_err(|e| {
            warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                db_path, e
            );
            e.into()
        })
}

impl StorageEngine for SledEngine {
    fn open_tree(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Tree>> {
        let tree = self.db.open_tree(name)?;
        Ok(Arc::new(SledTree { tree }))
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn to_pair(item: sled::Result<(sled::IVec, sled::IVec)>) -> Result<KvPair> {
    let (k, v) = item?;
    Ok((k.to_vec(), v.to_vec()))
}

impl Tree for SledTree {
    fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn insert(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn remove(
        &self,
        key: &[u8],
    ) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KvPair>> {
        self.tree.scan_prefix(prefix).map(to_pair).collect()
    }

    fn range(
        &self,
        start: &[u8],
        end: Option<Vec<u8>>,
    ) -> Result<Vec<KvPair>> {
        match end {
            Some(end) => self.tree.range(start..end.as_slice()).map(to_pair).collect(),
            None => self.tree.range(start..).map(to_pair).collect(),
        }
    }

    fn first(&self) -> Result<Option<KvPair>> {
        Ok(self.tree.first()?.map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    fn last(&self) -> Result<Option<KvPair>> {
        Ok(self.tree.last()?.map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    fn apply_batch(
        &self,
        ops: Vec<BatchOp>,
    ) -> Result<()> {
        let mut batch = Batch::default();
        for op in ops {
            match op {
                BatchOp::Insert(k, v) => batch.insert(k, v),
                BatchOp::Remove(k) => batch.remove(k),
            }
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}
