pub(crate) mod async_task;
pub(crate) mod cluster;
pub(crate) mod convert;
pub mod id;
pub mod net;
pub(crate) mod time;
