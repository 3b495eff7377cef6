//! Error types for fathom

use thiserror::Error;

use crate::types::MasterSlaveSettings;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No eligible node is active for a shard under the requested
    /// consistency setting. Recoverable by retrying after a topology change.
    #[error("Shard {shard} of index '{index}' is offline for {settings:?}")]
    ShardOffline {
        index: String,
        shard: u32,
        settings: MasterSlaveSettings,
    },

    /// The computed shard number has no mapping. Indicates a topology bug.
    #[error("Shard {shard} of index '{index}' does not exist")]
    ShardDoesNotExist { index: String, shard: u32 },

    #[error("Index does not exist: {0}")]
    IndexDoesNotExist(String),

    /// A mutation was attempted against a non-primary shard, or a
    /// primary-only maintenance operation against a replica.
    #[error("Illegal shard state: {0}")]
    IllegalShardState(String),

    #[error("Remote execution failed on {node}: {message}")]
    RemoteExecutionFailure { node: String, message: String },

    /// A reindex pass detected that a newer pass superseded it.
    #[error("Reindex of shard {shard} of index '{index}' was interrupted by a newer pass")]
    InterruptedReindex { index: String, shard: u32 },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn engine(msg: impl Into<String>) -> Self {
        Error::Engine(msg.into())
    }

    pub fn blob(msg: impl Into<String>) -> Self {
        Error::Blob(msg.into())
    }

    pub fn illegal_shard_state(msg: impl Into<String>) -> Self {
        Error::IllegalShardState(msg.into())
    }

    pub fn remote(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::RemoteExecutionFailure {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// True for errors a caller may retry after the cluster topology changes.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ShardOffline { .. })
    }
}
