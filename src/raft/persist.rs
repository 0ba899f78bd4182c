use crate::raft::log::{LogEntry, LogIndex, Term};
use crate::raft::peers::ReplicaId;
use bytes::Bytes;
use std::sync::Mutex;

/// Persister is the stable-storage seam the replication core writes through
/// whenever the protocol requires durability before replying. Two blobs live
/// behind it: the raft state and the state-machine snapshot, replaced
/// together atomically when a snapshot is taken or installed.
pub trait Persister: Send + Sync + 'static {
    fn save_raft_state(&self, state: Bytes);
    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes);
    fn read_raft_state(&self) -> Bytes;
    fn read_snapshot(&self) -> Bytes;
    fn raft_state_size(&self) -> usize;
}

/// In-memory dual-slot persister. A single lock over both slots makes the
/// state+snapshot save atomic with respect to readers.
pub struct MemoryPersister {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    raft_state: Bytes,
    snapshot: Bytes,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister {
            slots: Mutex::new(Slots::default()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().expect("persister lock poisoned")
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl Persister for MemoryPersister {
    fn save_raft_state(&self, state: Bytes) {
        self.locked().raft_state = state;
    }

    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes) {
        let mut slots = self.locked();
        slots.raft_state = state;
        slots.snapshot = snapshot;
    }

    fn read_raft_state(&self) -> Bytes {
        self.locked().raft_state.clone()
    }

    fn read_snapshot(&self) -> Bytes {
        self.locked().snapshot.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.locked().raft_state.len()
    }
}

/// Raft state recovered from a persisted blob.
pub(crate) struct RecoveredState {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) entries: Vec<LogEntry>,
    pub(crate) last_included_index: LogIndex,
    pub(crate) last_included_term: Term,
}

/// Blob layout is the tuple (current_term, voted_for, entries,
/// last_included_index, last_included_term), in that order. Changing the
/// order breaks recovery of previously persisted state.
pub(crate) fn encode_state(
    current_term: Term,
    voted_for: Option<ReplicaId>,
    entries: &[LogEntry],
    last_included_index: LogIndex,
    last_included_term: Term,
) -> Bytes {
    let blob = bincode::serialize(&(
        current_term,
        voted_for,
        entries,
        last_included_index,
        last_included_term,
    ))
    .expect("raft state is always encodable");
    Bytes::from(blob)
}

pub(crate) fn decode_state(blob: &Bytes) -> Result<RecoveredState, bincode::Error> {
    type Wire = (Term, Option<ReplicaId>, Vec<LogEntry>, LogIndex, Term);
    let (current_term, voted_for, entries, last_included_index, last_included_term): Wire =
        bincode::deserialize(blob)?;
    Ok(RecoveredState {
        current_term,
        voted_for,
        entries,
        last_included_index,
        last_included_term,
    })
}
