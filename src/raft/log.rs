use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Term is the logical clock of the election protocol. Terms only ever move
/// forward on a given replica.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn val(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// LogIndex is the logical position of an entry in the replicated log. It is
/// globally monotonic from 1 upward and keeps counting across compaction;
/// index 0 is a sentinel with term 0.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    pub fn val(self) -> u64 {
        self.0
    }

    pub fn plus(self, n: u64) -> LogIndex {
        LogIndex(self.0 + n)
    }

    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// One slot of the replicated log. The command is opaque at this layer; the
/// state machine above decides what the bytes mean.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Bytes,
}

/// LogBuffer holds the un-compacted suffix of the replicated log together
/// with the identity of the last compacted entry.
///
/// This is the only place in the crate that converts between logical indices
/// and positions in the in-memory suffix; everything else speaks logical
/// indices exclusively.
pub(crate) struct LogBuffer {
    /// Entries with logical index > `last_included_index`, in order.
    entries: Vec<LogEntry>,
    last_included_index: LogIndex,
    last_included_term: Term,
}

impl LogBuffer {
    pub(crate) fn new() -> Self {
        LogBuffer {
            entries: Vec::new(),
            last_included_index: LogIndex::ZERO,
            last_included_term: Term::default(),
        }
    }

    pub(crate) fn restore(entries: Vec<LogEntry>, last_included_index: LogIndex, last_included_term: Term) -> Self {
        LogBuffer {
            entries,
            last_included_index,
            last_included_term,
        }
    }

    pub(crate) fn last_included_index(&self) -> LogIndex {
        self.last_included_index
    }

    pub(crate) fn last_included_term(&self) -> Term {
        self.last_included_term
    }

    pub(crate) fn last_index(&self) -> LogIndex {
        self.last_included_index.plus(self.entries.len() as u64)
    }

    pub(crate) fn last_term(&self) -> Term {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.last_included_term,
        }
    }

    /// Position of `index` within the in-memory suffix. Callers must have
    /// checked `index > last_included_index`.
    fn offset(&self, index: LogIndex) -> usize {
        (index.val() - self.last_included_index.val() - 1) as usize
    }

    /// Term of the entry at `index`, treating the last compacted entry (and
    /// the index-0 sentinel) as present. None if `index` has been compacted
    /// away or lies past the end of the log.
    pub(crate) fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        if index < self.last_included_index || index > self.last_index() {
            return None;
        }
        Some(self.entries[self.offset(index)].term)
    }

    pub(crate) fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.last_included_index || index > self.last_index() {
            return None;
        }
        Some(&self.entries[self.offset(index)])
    }

    pub(crate) fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Drops every entry with logical index >= `index`.
    pub(crate) fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.last_included_index {
            self.entries.clear();
            return;
        }
        let keep = self.offset(index);
        self.entries.truncate(keep);
    }

    /// Clones the entries with logical index > `after`, for shipping to a
    /// peer. `after` must not have been compacted away.
    pub(crate) fn entries_after(&self, after: LogIndex) -> Vec<LogEntry> {
        if after >= self.last_index() {
            return Vec::new();
        }
        let start = if after == self.last_included_index {
            0
        } else {
            self.offset(after) + 1
        };
        self.entries[start..].to_vec()
    }

    /// First logical index of the run of entries with `term` that ends at
    /// `at`. `at` must be in the suffix and carry `term`. Used to fill the
    /// conflict hint on a rejected append.
    pub(crate) fn first_index_with_term(&self, term: Term, at: LogIndex) -> LogIndex {
        let mut first = at;
        while first.prev() > self.last_included_index && self.term_at(first.prev()) == Some(term) {
            first = first.prev();
        }
        first
    }

    /// Last logical index holding `term`, if the suffix has any such entry.
    /// Terms are non-decreasing along the log, so scan backward and stop once
    /// terms drop below the target.
    pub(crate) fn last_index_with_term(&self, term: Term) -> Option<LogIndex> {
        let mut index = self.last_index();
        while index > self.last_included_index {
            match self.term_at(index) {
                Some(t) if t == term => return Some(index),
                Some(t) if t < term => return None,
                _ => index = index.prev(),
            }
        }
        None
    }

    /// Log compaction on the snapshot-taking side: forget entries up to and
    /// including `index`, which must be <= last_index.
    pub(crate) fn compact_through(&mut self, index: LogIndex, term: Term) {
        let keep = self.entries_after(index);
        self.entries = keep;
        self.last_included_index = index;
        self.last_included_term = term;
    }

    /// Log adjustment on the snapshot-receiving side. If we hold the entry at
    /// `index` with the matching term, entries past it survive; otherwise the
    /// whole suffix is inconsistent with the snapshot and is discarded.
    pub(crate) fn cut_for_snapshot(&mut self, index: LogIndex, term: Term) {
        if self.term_at(index) == Some(term) {
            self.entries = self.entries_after(index);
        } else {
            self.entries.clear();
        }
        self.last_included_index = index;
        self.last_included_term = term;
    }

    pub(crate) fn suffix(&self) -> &[LogEntry] {
        &self.entries
    }
}
