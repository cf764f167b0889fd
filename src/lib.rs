pub mod cluster;
pub mod config;

pub use cluster::error::{RaftError, RaftResult};
pub use cluster::log_store::Log;
pub use cluster::message::{
    AppendEntries, AppendEntriesResponse, Inbound, LogEntry, LogIndex, Message, NodeId,
    RequestVote, RequestVoteResponse, Term, MAX_DATAGRAM,
};
pub use cluster::node::{NodeHandle, RaftNode};
pub use cluster::state::{NodeStatus, RaftState, RoleKind};
pub use cluster::transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use config::{Config, NodeConfig, RaftConfig};
