// src/cluster/leader.rs
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::message::{AppendEntries, AppendEntriesResponse, LogEntry, LogIndex, Message, NodeId};
use super::state::{Shared, Transition};
use super::timer::Timer;

/// Leader bookkeeping.
///
/// `next_index` is the next entry to send to each peer and `match_index`
/// the highest entry known to be replicated there. Every heartbeat opens a
/// new request id; once a quorum has acknowledged an id, that id and all
/// older ones are closed and the step-down timer starts over. A leader that
/// goes a whole step-down interval without a quorum becomes a follower.
#[derive(Debug)]
pub struct Leader {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    heartbeat_timer: Timer,
    step_down_timer: Timer,
    request_id: u64,
    pending: HashMap<u64, HashSet<NodeId>>,
}

/// Takes entries from the front of `pending` until either cap is hit. The
/// first entry always goes so a follower can make progress.
fn batch(pending: &[LogEntry], max_entries: usize, max_bytes: usize) -> Vec<LogEntry> {
    let mut bytes = 0;
    let mut entries = Vec::new();
    for entry in pending.iter().take(max_entries) {
        bytes += entry.encoded_len();
        if bytes > max_bytes && !entries.is_empty() {
            break;
        }
        entries.push(entry.clone());
    }
    entries
}

impl Leader {
    pub(super) fn new(shared: &Shared, now: Instant) -> Self {
        let next = shared.log.last_index() + 1;
        let mut heartbeat_timer = Timer::fixed(shared.config.heartbeat_interval()).repeating();
        let mut step_down_timer = Timer::fixed(shared.config.step_down_interval());
        heartbeat_timer.start(now);
        step_down_timer.start(now);

        Leader {
            next_index: shared.peers.iter().map(|&p| (p, next)).collect(),
            match_index: shared.peers.iter().map(|&p| (p, 0)).collect(),
            heartbeat_timer,
            step_down_timer,
            request_id: 0,
            pending: HashMap::new(),
        }
    }

    pub fn next_index(&self, peer: NodeId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    pub fn match_index(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }

    /// Id of the most recent heartbeat round.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Number of heartbeat rounds still waiting for a quorum.
    pub fn pending_rounds(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn stop(&mut self) {
        self.heartbeat_timer.stop();
        self.step_down_timer.stop();
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        match (self.heartbeat_timer.deadline(), self.step_down_timer.deadline()) {
            (Some(heartbeat), Some(step_down)) => Some(heartbeat.min(step_down)),
            (heartbeat, step_down) => heartbeat.or(step_down),
        }
    }

    pub(super) fn on_timer(&mut self, shared: &mut Shared, now: Instant) -> Transition {
        if self.step_down_timer.fire(now) {
            warn!(
                node = %shared.id,
                term = shared.term,
                pending = self.pending.len(),
                "no quorum within step-down interval, stepping down"
            );
            return Transition::ToFollower;
        }
        if self.heartbeat_timer.fire(now) {
            self.heartbeat(shared, now);
        }
        Transition::Stay
    }

    /// Opens a new request id and sends every peer what it is missing.
    pub(super) fn heartbeat(&mut self, shared: &mut Shared, now: Instant) {
        self.request_id += 1;
        self.pending.insert(self.request_id, HashSet::new());
        trace!(request_id = self.request_id, "heartbeat");

        // With no peers the leader alone is a quorum
        if shared.is_majority(1) {
            self.acknowledge(self.request_id, now);
        }
        self.append_entries(shared, None);
    }

    /// Sends AppendEntries to one peer, or to all of them.
    pub(super) fn append_entries(&self, shared: &mut Shared, destination: Option<NodeId>) {
        match destination {
            Some(peer) => self.send_append_entries(shared, peer),
            None => {
                for peer in shared.peers.clone() {
                    self.send_append_entries(shared, peer);
                }
            }
        }
    }

    fn send_append_entries(&self, shared: &mut Shared, peer: NodeId) {
        let next = match self.next_index.get(&peer) {
            Some(&next) => next,
            None => return,
        };
        let prev_log_index = next - 1;
        let prev_log_term = shared.log.term_at(prev_log_index).unwrap_or(0);
        let entries = batch(
            shared.log.slice(next),
            shared.config.max_entries_per_append,
            shared.config.max_append_bytes,
        );

        let request = Message::AppendEntries(AppendEntries {
            term: shared.term,
            leader_id: shared.id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: shared.log.commit_index(),
            request_id: self.request_id,
        });
        shared.send(request, peer);
    }

    pub(super) fn handle(
        &mut self,
        shared: &mut Shared,
        message: &Message,
        sender: NodeId,
        now: Instant,
    ) -> Transition {
        match message {
            Message::AppendEntriesResponse(resp) => {
                self.on_append_entries_response(shared, resp, sender, now);
                Transition::Stay
            }
            Message::AppendEntries(req) if req.term >= shared.term => {
                warn!(
                    other = %req.leader_id,
                    term = req.term,
                    "another leader in the same term, stepping down"
                );
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
            Message::RequestVoteResponse(_) => Transition::Stay,
        }
    }

    fn on_append_entries_response(
        &mut self,
        shared: &mut Shared,
        resp: &AppendEntriesResponse,
        sender: NodeId,
        now: Instant,
    ) {
        if resp.term < shared.term {
            trace!(from = %sender, term = resp.term, "stale response ignored");
            return;
        }
        if !self.next_index.contains_key(&sender) {
            warn!(from = %sender, "response from unknown peer");
            return;
        }

        if let Some(acks) = self.pending.get_mut(&resp.request_id) {
            acks.insert(sender);
            if shared.is_majority(acks.len() + 1) {
                self.acknowledge(resp.request_id, now);
            }
        }

        if resp.success {
            let last = resp.last_log_index.min(shared.log.last_index());
            self.next_index.insert(sender, last + 1);
            let matched = self.match_index.entry(sender).or_insert(0);
            *matched = (*matched).max(last);

            self.advance_commit_index(shared);
            if shared.log.last_index() > last {
                self.send_append_entries(shared, sender);
            }
        } else {
            if let Some(next) = self.next_index.get_mut(&sender) {
                *next = next.saturating_sub(1).max(1);
                debug!(peer = %sender, next_index = *next, "append rejected, backing off");
            }
            self.send_append_entries(shared, sender);
        }
    }

    /// Closes `request_id` and every older round.
    fn acknowledge(&mut self, request_id: u64, now: Instant) {
        self.step_down_timer.reset(now);
        self.pending.retain(|&id, _| id > request_id);
    }

    /// Commits the highest current-term index held by a majority. Scanning
    /// stops at the first index without a majority.
    pub(super) fn advance_commit_index(&mut self, shared: &mut Shared) {
        let commit_index = shared.log.commit_index();
        let mut new_commit = commit_index;

        for index in (commit_index + 1)..=shared.log.last_index() {
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= index).count();
            if !shared.is_majority(replicas) {
                break;
            }
            if shared.log.term_at(index) == Some(shared.term) {
                new_commit = index;
            }
        }

        if new_commit > commit_index {
            match shared.log.commit(new_commit) {
                Ok(()) => debug!(commit_index = new_commit, "commit index advanced"),
                Err(e) => error!(error = %e, "failed to advance commit index"),
            }
        }
    }
}
