//! The transport seam between replicas. The replication core only ever talks
//! to `PeerTransport`; hosting environments decide what carries the bytes. An
//! in-process implementation with partition controls lives in `memory` and is
//! what the integration tests drive.
mod memory;

use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, ReplicaId,
    RequestVoteArgs, RequestVoteReply,
};
use async_trait::async_trait;

pub use memory::InMemoryNetwork;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer could not be reached or the message was lost. The caller
    /// drops the request; a later heartbeat or election retries naturally.
    #[error("peer unreachable")]
    Unreachable,
}

/// Outbound half of the transport: how a replica issues the three RPCs to a
/// named peer. One instance per replica, bound to that replica's identity.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(&self, to: ReplicaId, args: RequestVoteArgs) -> Result<RequestVoteReply, RpcError>;

    async fn append_entries(&self, to: ReplicaId, args: AppendEntriesArgs)
        -> Result<AppendEntriesReply, RpcError>;

    async fn install_snapshot(
        &self,
        to: ReplicaId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RpcError>;
}

/// Inbound half of the transport: the handler surface a replica exposes to
/// whatever hosts its RPC endpoint. Handlers are synchronous; they take the
/// replica lock, mutate, persist, and return the reply.
pub trait RaftRpcHandler: Send + Sync + 'static {
    fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;
    fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply;
    fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply;
}
