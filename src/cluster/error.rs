// src/cluster/error.rs
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A peer speaks a message kind this node does not know. Not transient.
    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("Log index {index} out of range (last index {last_index})")]
    LogIndexOutOfRange { index: u64, last_index: u64 },

    #[error("Cannot truncate from index {index}: entries up to {commit_index} are committed")]
    CommittedTruncation { index: u64, commit_index: u64 },

    #[error("Cannot move commit index back from {current} to {requested}")]
    CommitRegression { current: u64, requested: u64 },

    #[error("Command too large: entry encodes to {size} bytes, limit is {limit}")]
    CommandTooLarge { size: usize, limit: usize },

    #[error("Not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<SocketAddr> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node shut down: {0}")]
    Shutdown(String),
}

pub type RaftResult<T> = Result<T, RaftError>;
