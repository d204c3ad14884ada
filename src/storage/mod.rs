//! Storage engines, the replicated log's persistence and the mesh state
//! machine.

mod adaptors;
mod command;
mod mesh_storage;
mod raft_log;
mod state_machine;
mod state_storage;
mod storage_engine;

pub use adaptors::*;
pub use command::*;
pub use mesh_storage::*;
pub use raft_log::*;
pub use state_machine::*;
pub use state_storage::*;
pub use storage_engine::*;
