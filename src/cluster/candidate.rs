// src/cluster/candidate.rs
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::message::{AppendEntriesResponse, Message, NodeId, RequestVote};
use super::state::{Shared, Transition};
use super::timer::Timer;

/// Campaigning role. Holds the votes gathered in the current term; the
/// node's own vote is counted from the start.
#[derive(Debug)]
pub struct Candidate {
    election_timer: Timer,
    votes: HashSet<NodeId>,
}

impl Candidate {
    pub(super) fn new(shared: &Shared) -> Self {
        let mut votes = HashSet::new();
        votes.insert(shared.id);
        Candidate {
            election_timer: Timer::randomized(
                shared.config.election_timeout_min(),
                shared.config.election_timeout_max(),
            ),
            votes,
        }
    }

    /// Arms the election timer and asks every peer for a vote.
    pub(super) fn start(&mut self, shared: &mut Shared, now: Instant) -> Transition {
        self.election_timer.start(now);
        info!(node = %shared.id, term = shared.term, "starting election");

        if shared.peers.is_empty() {
            return Transition::ToLeader;
        }
        shared.broadcast(Message::RequestVote(RequestVote {
            term: shared.term,
            candidate_id: shared.id,
            last_log_index: shared.log.last_index(),
            last_log_term: shared.log.last_term(),
        }));
        Transition::Stay
    }

    pub(super) fn stop(&mut self) {
        self.election_timer.stop();
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.election_timer.deadline()
    }

    #[cfg(test)]
    pub(super) fn votes(&self) -> usize {
        self.votes.len()
    }

    /// An election that neither wins nor loses is retried in a fresh term.
    pub(super) fn on_timer(&mut self, now: Instant) -> Transition {
        if self.election_timer.fire(now) {
            debug!(votes = self.votes.len(), "election timed out");
            return Transition::Reelect;
        }
        Transition::Stay
    }

    pub(super) fn handle(&mut self, shared: &mut Shared, message: &Message, sender: NodeId) -> Transition {
        match message {
            Message::RequestVoteResponse(resp) => {
                if resp.term != shared.term || !resp.vote_granted {
                    trace!(from = %sender, term = resp.term, "vote not counted");
                    return Transition::Stay;
                }
                if !shared.peers.contains(&sender) {
                    warn!(from = %sender, "vote from a non-member ignored");
                    return Transition::Stay;
                }
                self.votes.insert(sender);
                debug!(from = %sender, votes = self.votes.len(), "vote received");
                if shared.is_majority(self.votes.len()) {
                    return Transition::ToLeader;
                }
                Transition::Stay
            }
            Message::AppendEntries(req) if req.term >= shared.term => {
                debug!(leader = %req.leader_id, term = req.term, "leader found, stepping down");
                Transition::StepDown
            }
            Message::AppendEntries(req) => {
                let response = Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: shared.term,
                    success: false,
                    last_log_index: shared.log.last_index(),
                    request_id: req.request_id,
                });
                shared.send(response, sender);
                Transition::Stay
            }
            Message::RequestVote(req) => {
                shared.vote(req, sender);
                Transition::Stay
            }
            Message::AppendEntriesResponse(_) => Transition::Stay,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::message::{AppendEntries, Message, RequestVote, RequestVoteResponse};
    use crate::cluster::state::tests::{addr, expire, new_node};
    use crate::cluster::state::{RaftState, Role, RoleKind};
    use tokio::time::Instant;

    fn candidate() -> RaftState {
        let mut node = new_node(1, &[2, 3, 4, 5], Instant::now());
        expire(&mut node);
        node.take_outbox();
        node
    }

    fn votes(node: &RaftState) -> usize {
        match &node.role {
            Role::Candidate(candidate) => candidate.votes(),
            _ => panic!("not a candidate"),
        }
    }

    #[test]
    fn test_candidate_votes_for_itself() {
        let node = candidate();
        assert_eq!(node.role(), RoleKind::Candidate);
        assert_eq!(node.voted_for(), Some(addr(1)));
        assert_eq!(votes(&node), 1);
        assert!(node.current_leader().is_none());
    }

    #[test]
    fn test_refused_vote_not_counted() {
        let mut node = candidate();
        node.handle(
            Message::RequestVoteResponse(RequestVoteResponse {
                term: 1,
                vote_granted: false,
            }),
            addr(2),
            Instant::now(),
        );
        assert_eq!(votes(&node), 1);
    }

    #[test]
    fn test_refuses_other_candidate_in_same_term() {
        let mut node = candidate();
        node.handle(
            Message::RequestVote(RequestVote {
                term: 1,
                candidate_id: addr(2),
                last_log_index: 0,
                last_log_term: 0,
            }),
            addr(2),
            Instant::now(),
        );
        assert_eq!(node.role(), RoleKind::Candidate);
        match node.take_outbox().pop() {
            Some((Message::RequestVoteResponse(r), dest)) => {
                assert!(!r.vote_granted);
                assert_eq!(dest, addr(2));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_append_from_current_leader_steps_down_and_is_answered() {
        let mut node = candidate();
        node.handle(
            Message::AppendEntries(AppendEntries {
                term: 1,
                leader_id: addr(3),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                commit_index: 0,
                request_id: 9,
            }),
            addr(3),
            Instant::now(),
        );
        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.term(), 1);
        assert_eq!(node.current_leader(), Some(addr(3)));
        match node.take_outbox().pop() {
            Some((Message::AppendEntriesResponse(r), _)) => {
                assert!(r.success);
                assert_eq!(r.request_id, 9);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_append_from_stale_leader_rejected() {
        let mut node = candidate();
        expire(&mut node);
        node.take_outbox();
        assert_eq!(node.term(), 2);
        node.handle(
            Message::AppendEntries(AppendEntries {
                term: 1,
                leader_id: addr(3),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                commit_index: 0,
                request_id: 1,
            }),
            addr(3),
            Instant::now(),
        );
        assert_eq!(node.role(), RoleKind::Candidate);
        match node.take_outbox().pop() {
            Some((Message::AppendEntriesResponse(r), _)) => {
                assert!(!r.success);
                assert_eq!(r.term, 2);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_winning_election_sends_heartbeat() {
        let mut node = new_node(1, &[2, 3], Instant::now());
        expire(&mut node);
        node.take_outbox();
        node.handle(
            Message::RequestVoteResponse(RequestVoteResponse {
                term: 1,
                vote_granted: true,
            }),
            addr(2),
            Instant::now(),
        );
        assert_eq!(node.role(), RoleKind::Leader);
        assert_eq!(node.current_leader(), Some(addr(1)));
        let outbox = node.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert!(outbox
            .iter()
            .all(|(m, _)| matches!(m, Message::AppendEntries(a) if a.entries.is_empty() && a.term == 1)));
    }

    #[test]
    fn test_vote_from_non_member_not_counted() {
        let mut node = new_node(1, &[2, 3], Instant::now());
        expire(&mut node);
        node.take_outbox();
        let grant = || {
            Message::RequestVoteResponse(RequestVoteResponse {
                term: 1,
                vote_granted: true,
            })
        };

        node.handle(grant(), addr(99), Instant::now());
        assert_eq!(node.role(), RoleKind::Candidate);
        assert_eq!(votes(&node), 1);
        assert!(node.take_outbox().is_empty());

        // A member's vote still wins the election
        node.handle(grant(), addr(3), Instant::now());
        assert_eq!(node.role(), RoleKind::Leader);
    }
}
