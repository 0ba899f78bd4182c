mod log;
mod message;
mod peers;
mod persist;
mod replica;

pub use log::LogEntry;
pub use log::LogIndex;
pub use log::Term;
pub use message::AppendEntriesArgs;
pub use message::AppendEntriesReply;
pub use message::ConflictHint;
pub use message::InstallSnapshotArgs;
pub use message::InstallSnapshotReply;
pub use message::RequestVoteArgs;
pub use message::RequestVoteReply;
pub use peers::ReplicaId;
pub use persist::MemoryPersister;
pub use persist::Persister;
pub use replica::ProposeError;
pub use replica::Replica;
pub use replica::ReplicaConfig;
