//! Mesh Node Error Hierarchy
//!
//! Errors are grouped by layer (system, configuration, consensus, plugins)
//! plus the request-level taxonomy every RPC handler reports through
//! [`tonic::Status`]. [`Error::code`] is the single place that decides which
//! status code a failure surfaces as.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;
use tonic::Code;
use tonic::Status;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, storage, serialization)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Replicated log failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Plugin lifecycle and query channel failures
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Entity absent: unknown peer, missing key, missing ACL
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request rejected before anything was applied
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller identity does not match or lacks a grant
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Wrong role or lifecycle state for the operation
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Address pool has no free entries left
    #[error("no more addresses in {0}")]
    Exhausted(String),

    /// Deadline exceeded while waiting on consensus or forwarding
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Waiter stopped by a cancellation signal
    #[error("operation canceled")]
    Canceled,

    /// Failure after an external side effect already happened. Both causes
    /// are kept so the inconsistency stays visible.
    #[error("{context}: {source}")]
    Internal {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Node failed to start: {0}")]
    NodeStartFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Peer is not registered with the transport or has been isolated
    #[error("Node {node_id} unreachable")]
    Unreachable { node_id: String },

    /// A channel the operation depends on was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Status returned by a remote service
    #[error(transparent)]
    Status(#[from] Box<Status>),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// State machine application errors
    #[error("State Machine error: {0}")]
    StateMachineError(String),

    /// Log storage subsystem failures
    #[error("Log storage failure: {0}")]
    LogStorage(String),

    /// Snapshot creation/restoration failures
    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    /// Stored bytes that cannot be decoded
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Bincode serialization failed: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Write issued to a node that is not the leader
    #[error("Not leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<String> },

    /// Election in progress, nobody to forward to
    #[error("No leader is currently elected")]
    NoLeader,

    /// Majority of voters did not store the entry
    #[error("Quorum not reached (required: {required}, succeed: {succeed})")]
    QuorumNotReached { required: usize, succeed: usize },

    /// Stale term observed while acting as leader or candidate
    #[error("Found higher term(={0})")]
    HigherTerm(u64),

    /// Configuration change referencing a server outside the cluster
    #[error("Unknown server {0}")]
    UnknownServer(String),

    /// Configuration change rejected
    #[error("Membership change failed: {0}")]
    Membership(String),

    /// The consensus module was shut down
    #[error("Consensus module is shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin used before its query channel was established
    #[error("plugin not configured")]
    NotConfigured,

    #[error("plugin {0} is not registered")]
    UnknownPlugin(String),

    #[error("plugin {0} is already registered")]
    AlreadyRegistered(String),

    /// Declared capability without the matching implementation
    #[error("plugin {plugin} declares {capability} but does not implement it")]
    MissingCapability { plugin: String, capability: String },

    /// No registered plugin provides the capability
    #[error("no plugin provides {0}")]
    NoProvider(String),

    /// Opaque configuration map failed schema validation
    #[error("invalid configuration for plugin {plugin}: {reason}")]
    InvalidConfig { plugin: String, reason: String },

    /// Query channel closed by either side
    #[error("query channel closed")]
    ChannelClosed,

    /// Event dispatch queue is full; the event was dropped
    #[error("plugin event queue is full")]
    QueueFull,
}

impl Error {
    /// Status code this error is reported with at the RPC boundary.
    pub fn code(&self) -> Code {
        match self {
            Error::NotFound(_) | Error::Exhausted(_) => Code::NotFound,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::PermissionDenied(_) => Code::PermissionDenied,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Timeout(_) => Code::DeadlineExceeded,
            Error::Canceled => Code::Cancelled,
            Error::Config(_) => Code::InvalidArgument,
            Error::Consensus(e) => match e {
                ConsensusError::NotLeader { .. } | ConsensusError::NoLeader => {
                    Code::FailedPrecondition
                }
                ConsensusError::QuorumNotReached { .. } => Code::Unavailable,
                ConsensusError::Shutdown => Code::Unavailable,
                ConsensusError::HigherTerm(_)
                | ConsensusError::UnknownServer(_)
                | ConsensusError::Membership(_) => Code::Internal,
            },
            Error::Plugin(e) => match e {
                PluginError::NotConfigured | PluginError::ChannelClosed => {
                    Code::FailedPrecondition
                }
                PluginError::UnknownPlugin(_) | PluginError::NoProvider(_) => Code::NotFound,
                PluginError::AlreadyRegistered(_) => Code::AlreadyExists,
                PluginError::QueueFull => Code::ResourceExhausted,
                PluginError::MissingCapability { .. } | PluginError::InvalidConfig { .. } => {
                    Code::InvalidArgument
                }
            },
            Error::System(SystemError::Network(NetworkError::Status(status))) => status.code(),
            Error::System(SystemError::Network(NetworkError::Unreachable { .. })) => {
                Code::Unavailable
            }
            Error::System(_) | Error::Internal { .. } | Error::Fatal(_) => Code::Internal,
        }
    }

    /// Wraps `self` as the cause of an [`Error::Internal`].
    pub fn context(
        self,
        context: impl Into<String>,
    ) -> Error {
        Error::Internal {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }
}

// ============== Conversion Implementations ============== //
impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            // Forwarded statuses keep their original message.
            Error::System(SystemError::Network(NetworkError::Status(status))) => *status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        NetworkError::Status(Box::new(status)).into()
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<SerializationError> for Error {
    fn from(e: SerializationError) -> Self {
        Error::System(SystemError::Serialization(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        SerializationError::Bincode(e).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        SerializationError::Json(e).into()
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::DbError(err.to_string()).into()
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        NetworkError::TaskFailed(err).into()
    }
}
