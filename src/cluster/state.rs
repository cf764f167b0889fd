// src/cluster/state.rs
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::candidate::Candidate;
use super::error::{RaftError, RaftResult};
use super::follower::Follower;
use super::leader::Leader;
use super::log_store::Log;
use super::message::{LogEntry, LogIndex, Message, NodeId, RequestVote, RequestVoteResponse, Term};
use crate::config::RaftConfig;

// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

/// Exactly one role is active at a time. Replacing the role drops the old
/// one together with its timers.
#[derive(Debug)]
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self {
            Role::Follower(follower) => follower.next_deadline(),
            Role::Candidate(candidate) => candidate.next_deadline(),
            Role::Leader(leader) => leader.next_deadline(),
        }
    }

    fn stop_timers(&mut self) {
        match self {
            Role::Follower(follower) => follower.stop(),
            Role::Candidate(candidate) => candidate.stop(),
            Role::Leader(leader) => leader.stop(),
        }
    }
}

/// What a role handler asks the state machine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Transition {
    Stay,
    ToFollower,
    /// Become follower and hand the message being processed to the new follower.
    StepDown,
    /// Become follower and immediately start a new election.
    Reelect,
    ToCandidate,
    ToLeader,
}

/// State shared by every role: the single source of truth for term, vote,
/// log and membership, plus the queue of messages waiting to be sent.
#[derive(Debug)]
pub struct Shared {
    pub(super) id: NodeId,
    pub(super) peers: Vec<NodeId>,
    pub(super) config: RaftConfig,
    pub(super) term: Term,
    pub(super) voted_for: Option<NodeId>,
    pub(super) leader: Option<NodeId>,
    pub(super) log: Log,
    outbox: Vec<(Message, NodeId)>,
}

impl Shared {
    pub(super) fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub(super) fn is_majority(&self, count: usize) -> bool {
        count > self.cluster_size() / 2
    }

    pub(super) fn send(&mut self, message: Message, destination: NodeId) {
        self.outbox.push((message, destination));
    }

    pub(super) fn broadcast(&mut self, message: Message) {
        for peer in self.peers.clone() {
            self.send(message.clone(), peer);
        }
    }

    /// Adopts a strictly higher term, forgetting the vote and leader of the old one.
    fn advance_term(&mut self, term: Term) -> bool {
        if term <= self.term {
            return false;
        }
        debug!(node = %self.id, from = self.term, to = term, "term advanced");
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        true
    }

    /// Decides a RequestVote and replies to `sender`. Returns whether the vote was granted.
    pub(super) fn vote(&mut self, req: &RequestVote, sender: NodeId) -> bool {
        let granted = if req.term < self.term {
            false
        } else {
            let can_vote = self.voted_for.map_or(true, |v| v == req.candidate_id);
            let up_to_date = (req.last_log_term, req.last_log_index)
                >= (self.log.last_term(), self.log.last_index());
            can_vote && up_to_date
        };

        if granted {
            self.voted_for = Some(req.candidate_id);
            debug!(node = %self.id, term = self.term, candidate = %req.candidate_id, "vote granted");
        }

        let response = Message::RequestVoteResponse(RequestVoteResponse {
            term: self.term,
            vote_granted: granted,
        });
        self.send(response, sender);
        granted
    }
}

/// A point-in-time view of a node, cheap to clone and publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
}

/// The Raft state machine of one node.
///
/// It is driven from outside by `handle` for every inbound message and
/// `tick` whenever `next_deadline` passes. Neither call blocks; messages to
/// send pile up in an outbox drained with `take_outbox`. Role transitions
/// happen inside these calls, so no message is ever seen mid-transition.
#[derive(Debug)]
pub struct RaftState {
    shared: Shared,
    pub(super) role: Role,
}

impl RaftState {
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: RaftConfig) -> Self {
        let mut unique = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer != id && !unique.contains(&peer) {
                unique.push(peer);
            }
        }
        let role = Role::Follower(Follower::new(&config));
        RaftState {
            shared: Shared {
                id,
                peers: unique,
                config,
                term: 0,
                voted_for: None,
                leader: None,
                log: Log::new(),
                outbox: Vec::new(),
            },
            role,
        }
    }

    /// Arms the initial follower's election timer.
    pub fn start(&mut self, now: Instant) {
        info!(node = %self.shared.id, peers = ?self.shared.peers, "node started");
        self.become_follower(now);
    }

    /// Cancels every pending timer of the current role.
    pub fn stop(&mut self) {
        self.role.stop_timers();
        info!(node = %self.shared.id, term = self.shared.term, "node stopped");
    }

    pub fn handle(&mut self, message: Message, sender: NodeId, now: Instant) {
        if sender == self.shared.id {
            warn!(node = %self.shared.id, kind = message.kind(), "ignoring message from self");
            return;
        }

        if self.shared.advance_term(message.term()) && self.role.kind() != RoleKind::Follower {
            self.become_follower(now);
        }

        let transition = self.dispatch(&message, sender, now);
        self.apply(transition, now);

        if transition == Transition::StepDown {
            let transition = self.dispatch(&message, sender, now);
            self.apply(transition, now);
        }
    }

    /// Fires whichever timers of the current role are due.
    pub fn tick(&mut self, now: Instant) {
        let transition = match &mut self.role {
            Role::Follower(follower) => follower.on_timer(now),
            Role::Candidate(candidate) => candidate.on_timer(now),
            Role::Leader(leader) => leader.on_timer(&mut self.shared, now),
        };
        self.apply(transition, now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.role.next_deadline()
    }

    pub fn take_outbox(&mut self) -> Vec<(Message, NodeId)> {
        std::mem::take(&mut self.shared.outbox)
    }

    /// Appends a command to the leader's log and starts replicating it.
    pub fn propose(&mut self, command: Vec<u8>) -> RaftResult<LogIndex> {
        match &mut self.role {
            Role::Leader(leader) => {
                let entry = LogEntry::new(self.shared.term, command);
                let (size, limit) = (entry.encoded_len(), self.shared.config.max_append_bytes);
                if size > limit {
                    return Err(RaftError::CommandTooLarge { size, limit });
                }
                let index = self.shared.log.append([entry]);
                leader.advance_commit_index(&mut self.shared);
                leader.append_entries(&mut self.shared, None);
                Ok(index)
            }
            _ => Err(RaftError::NotLeader {
                leader: self.shared.leader,
            }),
        }
    }

    /// Hands out committed entries that have not been applied yet.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        self.shared.log.take_unapplied()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.shared.id,
            role: self.role.kind(),
            term: self.shared.term,
            voted_for: self.shared.voted_for,
            leader: self.shared.leader,
            commit_index: self.shared.log.commit_index(),
            last_log_index: self.shared.log.last_index(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.shared.peers
    }

    pub fn term(&self) -> Term {
        self.shared.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.shared.voted_for
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.shared.leader
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn log(&self) -> &Log {
        &self.shared.log
    }

    pub fn leader_state(&self) -> Option<&Leader> {
        match &self.role {
            Role::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.cluster_size()
    }

    /// True iff `count` votes or replicas form a quorum of the cluster (self included).
    pub fn is_majority(&self, count: usize) -> bool {
        self.shared.is_majority(count)
    }

    fn dispatch(&mut self, message: &Message, sender: NodeId, now: Instant) -> Transition {
        match &mut self.role {
            Role::Follower(follower) => follower.handle(&mut self.shared, message, sender, now),
            Role::Candidate(candidate) => candidate.handle(&mut self.shared, message, sender),
            Role::Leader(leader) => leader.handle(&mut self.shared, message, sender, now),
        }
    }

    fn apply(&mut self, transition: Transition, now: Instant) {
        match transition {
            Transition::Stay => {}
            Transition::ToFollower | Transition::StepDown => self.become_follower(now),
            Transition::Reelect => {
                self.become_follower(now);
                self.become_candidate(now);
            }
            Transition::ToCandidate => self.become_candidate(now),
            Transition::ToLeader => self.become_leader(now),
        }
    }

    fn change_role(&mut self, role: Role) {
        let from = self.role.kind();
        let to = role.kind();
        self.role.stop_timers();
        self.role = role;
        if from != to {
            info!(node = %self.shared.id, term = self.shared.term, ?from, ?to, "role changed");
        }
    }

    fn become_follower(&mut self, now: Instant) {
        let mut follower = Follower::new(&self.shared.config);
        follower.start(now);
        self.change_role(Role::Follower(follower));
    }

    fn become_candidate(&mut self, now: Instant) {
        self.shared.term += 1;
        self.shared.voted_for = Some(self.shared.id);
        self.shared.leader = None;

        let mut candidate = Candidate::new(&self.shared);
        let transition = candidate.start(&mut self.shared, now);
        self.change_role(Role::Candidate(candidate));
        self.apply(transition, now);
    }

    fn become_leader(&mut self, now: Instant) {
        self.shared.leader = Some(self.shared.id);
        let mut leader = Leader::new(&self.shared, now);
        leader.heartbeat(&mut self.shared, now);
        self.change_role(Role::Leader(leader));
    }
}

#[cfg(test)]
impl RaftState {
    pub(crate) fn log_mut(&mut self) -> &mut Log {
        &mut self.shared.log
    }

    pub(crate) fn set_term(&mut self, term: Term) {
        self.shared.advance_term(term);
    }
}
