// src/cluster/follower.rs
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::message::{AppendEntries, AppendEntriesResponse, Message, NodeId, RequestVote};
use super::state::{Shared, Transition};
use super::timer::Timer;
use crate::config::RaftConfig;

/// Passive role: answers the leader and candidates, and starts an election
/// when nothing is heard from a leader for a whole election timeout.
#[derive(Debug)]
pub struct Follower {
    election_timer: Timer,
}

impl Follower {
    pub(super) fn new(config: &RaftConfig) -> Self {
        Follower {
            election_timer: Timer::randomized(
                config.election_timeout_min(),
                config.election_timeout_max(),
            ),
        }
    }

    pub(super) fn start(&mut self, now: Instant) {
        self.election_timer.start(now);
    }

    pub(super) fn stop(&mut self) {
        self.election_timer.stop();
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.election_timer.deadline()
    }

    pub(super) fn on_timer(&mut self, now: Instant) -> Transition {
        if self.election_timer.fire(now) {
            debug!("election timeout elapsed");
            return Transition::ToCandidate;
        }
        Transition::Stay
    }

    pub(super) fn handle(
        &mut self,
        shared: &mut Shared,
        message: &Message,
        sender: NodeId,
        now: Instant,
    ) -> Transition {
        match message {
            Message::AppendEntries(req) => self.on_append_entries(shared, req, sender, now),
            Message::RequestVote(req) => self.on_request_vote(shared, req, sender, now),
            Message::RequestVoteResponse(_) | Message::AppendEntriesResponse(_) => {
                trace!(kind = message.kind(), from = %sender, "follower ignores response");
            }
        }
        Transition::Stay
    }

    fn on_request_vote(&mut self, shared: &mut Shared, req: &RequestVote, sender: NodeId, now: Instant) {
        if shared.vote(req, sender) {
            self.election_timer.reset(now);
        }
    }

    fn on_append_entries(
        &mut self,
        shared: &mut Shared,
        req: &AppendEntries,
        sender: NodeId,
        now: Instant,
    ) {
        if req.term < shared.term {
            debug!(from = %sender, term = req.term, current = shared.term, "rejecting stale append");
            reply(shared, req, sender, false);
            return;
        }

        // A current leader exists, even if our logs disagree
        shared.leader = Some(req.leader_id);
        self.election_timer.reset(now);

        let prev_matches = shared.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
        if !prev_matches {
            debug!(
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                last_index = shared.log.last_index(),
                "log mismatch"
            );
            reply(shared, req, sender, false);
            return;
        }

        let first_new = req.entries.iter().enumerate().position(|(offset, entry)| {
            shared.log.term_at(req.prev_log_index + 1 + offset as u64) != Some(entry.term)
        });

        if let Some(offset) = first_new {
            let index = req.prev_log_index + 1 + offset as u64;
            if index <= shared.log.last_index() {
                if let Err(e) = shared.log.truncate_from(index) {
                    error!(error = %e, "refusing to replace entries");
                    reply(shared, req, sender, false);
                    return;
                }
            }
            shared.log.append(req.entries[offset..].iter().cloned());
            trace!(from = index, count = req.entries.len() - offset, "entries appended");
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let commit_to = req.commit_index.min(last_new);
        if commit_to > shared.log.commit_index() {
            match shared.log.commit(commit_to) {
                Ok(()) => debug!(commit_index = commit_to, "commit index advanced"),
                Err(e) => error!(error = %e, "failed to advance commit index"),
            }
        }

        reply(shared, req, sender, true);
    }
}

fn reply(shared: &mut Shared, req: &AppendEntries, sender: NodeId, success: bool) {
    let last_log_index = if success {
        req.prev_log_index + req.entries.len() as u64
    } else {
        shared.log.last_index()
    };
    let response = Message::AppendEntriesResponse(AppendEntriesResponse {
        term: shared.term,
        success,
        last_log_index,
        request_id: req.request_id,
    });
    shared.send(response, sender);
}
