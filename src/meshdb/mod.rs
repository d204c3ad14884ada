//! Typed accessors over the mesh key space.
//!
//! Every entity is a JSON value under a well-known prefix. The accessors
//! are thin codecs: reads go to local storage, writes go through consensus.

mod networking;
mod peers;
mod state;

pub use networking::*;
pub use peers::*;
pub use state::*;

#[cfg(test)]
mod networking_test;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::MeshStorage;
use crate::Result;

/// Entry point to the typed accessors of one storage handle
#[derive(Clone)]
pub struct MeshDb {
    storage: Arc<dyn MeshStorage>,
}

impl MeshDb {
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn MeshStorage> {
        &self.storage
    }

    pub fn peers(&self) -> Peers {
        Peers::new(self.storage.clone())
    }

    pub fn networking(&self) -> Networking {
        Networking::new(self.storage.clone())
    }

    pub fn state(&self) -> MeshState {
        MeshState::new(self.storage.clone())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
