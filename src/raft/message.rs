//! Wire types for the three inter-replica RPCs. They are plain data, serde
//! derived so a transport may carry them in whatever encoding it likes.

use crate::raft::log::{LogEntry, LogIndex, Term};
use crate::raft::peers::ReplicaId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: ReplicaId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// Filled on a log-consistency rejection; absent when the request was
    /// refused for a stale term.
    pub conflict: Option<ConflictHint>,
}

/// Rollback hint letting the leader skip whole terms of mismatched follower
/// log per round trip instead of probing one entry at a time.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct ConflictHint {
    /// Term of the follower's conflicting entry at `prev_log_index`; None
    /// when the follower's log is too short to contain that index.
    pub term: Option<Term>,
    /// First index in the follower's log carrying `term`. Meaningless when
    /// `term` is None.
    pub first_index: LogIndex,
    /// The follower's `last_log_index + 1`.
    pub log_len: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Bytes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}
