mod api;
mod kv;
mod net;
mod raft;

pub use api::ApplyMsg;
pub use api::ApplyReceiver;
pub use api::ApplySender;
pub use api::InvalidOptions;
pub use api::RaftOptions;
pub use kv::ClientId;
pub use kv::GetArgs;
pub use kv::GetReply;
pub use kv::KvConfig;
pub use kv::KvServer;
pub use kv::PutAppendArgs;
pub use kv::PutAppendOp;
pub use kv::PutAppendReply;
pub use net::InMemoryNetwork;
pub use net::PeerTransport;
pub use net::RaftRpcHandler;
pub use net::RpcError;
pub use raft::AppendEntriesArgs;
pub use raft::AppendEntriesReply;
pub use raft::ConflictHint;
pub use raft::InstallSnapshotArgs;
pub use raft::InstallSnapshotReply;
pub use raft::LogEntry;
pub use raft::LogIndex;
pub use raft::MemoryPersister;
pub use raft::Persister;
pub use raft::ProposeError;
pub use raft::Replica;
pub use raft::ReplicaConfig;
pub use raft::ReplicaId;
pub use raft::RequestVoteArgs;
pub use raft::RequestVoteReply;
pub use raft::Term;

// The crate root only exports; implementation lives in the modules and each
// module's mod.rs decides what leaves it.
