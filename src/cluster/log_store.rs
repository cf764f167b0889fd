// src/cluster/log_store.rs
use super::error::{RaftError, RaftResult};
use super::message::{LogEntry, LogIndex, Term};

/// In-memory replicated log.
///
/// Indexing is 1-based; index 0 is the sentinel "no entry" whose term is 0.
/// Entries at or below `commit_index` are never truncated, and neither
/// `commit_index` nor `last_applied` ever move backwards.
#[derive(Debug, Default, Clone)]
pub struct Log {
    entries: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl Log {
    pub fn new() -> Self {
        Log::default()
    }

    /// Appends entries to the tail and returns the new last index.
    pub fn append(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> LogIndex {
        self.entries.extend(entries);
        self.last_index()
    }

    /// Removes the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) -> RaftResult<()> {
        if index == 0 {
            return Err(RaftError::LogIndexOutOfRange {
                index,
                last_index: self.last_index(),
            });
        }
        if index <= self.commit_index {
            return Err(RaftError::CommittedTruncation {
                index,
                commit_index: self.commit_index,
            });
        }
        if index <= self.last_index() {
            self.entries.truncate((index - 1) as usize);
        }
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> RaftResult<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return Err(RaftError::LogIndexOutOfRange {
                index,
                last_index: self.last_index(),
            });
        }
        Ok(&self.entries[(index - 1) as usize])
    }

    /// Term of the entry at `index`; the sentinel index 0 has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).ok().map(|entry| entry.term)
    }

    /// Entries from `from` to the end, empty when `from` is past the tail.
    pub fn slice(&self, from: LogIndex) -> &[LogEntry] {
        let start = from.max(1);
        if start > self.last_index() {
            return &[];
        }
        &self.entries[(start - 1) as usize..]
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Moves `commit_index` forward. Committing past the tail or backwards fails.
    pub fn commit(&mut self, index: LogIndex) -> RaftResult<()> {
        if index > self.last_index() {
            return Err(RaftError::LogIndexOutOfRange {
                index,
                last_index: self.last_index(),
            });
        }
        if index < self.commit_index {
            return Err(RaftError::CommitRegression {
                current: self.commit_index,
                requested: index,
            });
        }
        self.commit_index = index;
        Ok(())
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the committed entries not yet handed out and marks them applied.
    pub fn take_unapplied(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let from = self.last_applied as usize;
        let to = self.commit_index as usize;
        self.last_applied = self.commit_index;
        self.entries[from..to].to_vec()
    }
}
