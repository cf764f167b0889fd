// src/cluster/message.rs
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::error::{RaftError, RaftResult};

/// Nodes are identified by the address they listen on.
pub type NodeId = SocketAddr;

/// Logical epoch counter. At most one legitimate leader per term.
pub type Term = u64;

/// 1-based position in the replicated log. Index 0 means "no entry".
pub type LogIndex = u64;

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, command: Vec<u8>) -> Self {
        LogEntry { term, command }
    }

    /// Bytes this entry takes inside an encoded `entries` array, separator
    /// included.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len() + 1)
    }
}

/// Sent by a candidate to every peer when it starts an election.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicates entries from the leader; with no entries it is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
    pub request_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Last index known to match the leader. Meaningless when `success` is false.
    pub last_log_index: LogIndex,
    pub request_id: u64,
}

/// The closed set of RPCs exchanged between nodes.
///
/// On the wire every message is a JSON object whose `type` field names the
/// variant in snake_case, e.g. `{"type": "request_vote", "term": 1, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

const MESSAGE_TYPES: [&str; 4] = [
    "request_vote",
    "request_vote_response",
    "append_entries",
    "append_entries_response",
];

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => MESSAGE_TYPES[0],
            Message::RequestVoteResponse(_) => MESSAGE_TYPES[1],
            Message::AppendEntries(_) => MESSAGE_TYPES[2],
            Message::AppendEntriesResponse(_) => MESSAGE_TYPES[3],
        }
    }

    pub fn encode(&self) -> RaftResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes one datagram.
    ///
    /// A well-formed object with an unrecognised `type` is reported as
    /// `UnknownMessageType` so callers can tell an incompatible peer apart
    /// from a corrupted datagram (`Serialization`).
    pub fn decode(bytes: &[u8]) -> RaftResult<Message> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            if !MESSAGE_TYPES.contains(&kind) {
                return Err(RaftError::UnknownMessageType(kind.to_string()));
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// A received message tagged with the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message: Message,
    pub sender: NodeId,
}
