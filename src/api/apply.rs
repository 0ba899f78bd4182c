use crate::raft::{LogIndex, Term};
use bytes::Bytes;
use tokio::sync::mpsc;

/// One element of the apply stream flowing from the replication core to the
/// state machine.
///
/// Messages carry strictly increasing indices with no gaps, except across a
/// `Snapshot` boundary: after a snapshot message, the next `Command` carries
/// the first index past the snapshot.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed log entry, to be applied to the state machine.
    Command {
        command: Bytes,
        index: LogIndex,
        term: Term,
    },
    /// A snapshot of the whole state machine; replaces in-memory state.
    Snapshot { data: Bytes },
}

/// Producing half of the apply stream. Held by the replication core.
pub type ApplySender = mpsc::UnboundedSender<ApplyMsg>;

/// Consuming half of the apply stream. Held by the state machine layer.
pub type ApplyReceiver = mpsc::UnboundedReceiver<ApplyMsg>;
