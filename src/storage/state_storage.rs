use std::sync::Arc;

use crate::constants::LAST_SNAPSHOT_KEY;
use crate::constants::STATE_STORAGE_HARD_STATE_KEY;
use crate::consensus::HardState;
use crate::consensus::Snapshot;
use crate::storage::Tree;
use crate::Result;

/// Term, vote and the latest snapshot of a node
pub struct StateStorage {
    tree: Arc<dyn Tree>,
}

impl StateStorage {
    pub fn new(tree: Arc<dyn Tree>) -> Self {
        Self { tree }
    }

    pub fn load_hard_state(&self) -> Result<Option<HardState>> {
        match self.tree.get(STATE_STORAGE_HARD_STATE_KEY.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_hard_state(
        &self,
        state: &HardState,
    ) -> Result<()> {
        self.tree.insert(STATE_STORAGE_HARD_STATE_KEY.as_bytes(), &bincode::serialize(state)?)?;
        self.tree.flush()
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.tree.get(LAST_SNAPSHOT_KEY.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<()> {
        self.tree.insert(LAST_SNAPSHOT_KEY.as_bytes(), &bincode::serialize(snapshot)?)?;
        self.tree.flush()
    }
}
