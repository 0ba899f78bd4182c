use crate::net::{PeerTransport, RaftRpcHandler, RpcError};
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, ReplicaId,
    RequestVoteArgs, RequestVoteReply,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

/// An in-process network of replicas. Requests are routed directly to the
/// destination's registered handler; links can be severed to simulate
/// partitions and crashes, and a drop fraction injects random message loss.
///
/// Handlers are held weakly, so a replica that has been dropped simply
/// becomes unreachable.
pub struct InMemoryNetwork {
    state: Mutex<NetState>,
}

#[derive(Default)]
struct NetState {
    handlers: HashMap<ReplicaId, Weak<dyn RaftRpcHandler>>,
    /// Directed pairs (from, to) across which messages are silently lost.
    severed: HashSet<(ReplicaId, ReplicaId)>,
    drop_fraction: f64,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryNetwork {
            state: Mutex::new(NetState::default()),
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().expect("network lock poisoned")
    }

    /// Registers (or replaces, after a restart) the handler for `id`.
    pub fn register(&self, id: ReplicaId, handler: &Arc<dyn RaftRpcHandler>) {
        self.locked().handlers.insert(id, Arc::downgrade(handler));
    }

    /// The transport handle replica `me` sends through.
    pub fn endpoint(self: &Arc<Self>, me: ReplicaId) -> Arc<dyn PeerTransport> {
        Arc::new(Endpoint {
            net: Arc::clone(self),
            me,
        })
    }

    /// Severs every link to and from `id`, as if the host dropped off the
    /// network.
    pub fn disconnect(&self, id: ReplicaId) {
        let mut state = self.locked();
        let others: Vec<ReplicaId> = state.handlers.keys().copied().filter(|&o| o != id).collect();
        for other in others {
            state.severed.insert((id, other));
            state.severed.insert((other, id));
        }
    }

    /// Restores every link to and from `id`.
    pub fn reconnect(&self, id: ReplicaId) {
        self.locked().severed.retain(|&(a, b)| a != id && b != id);
    }

    /// Splits the cluster into the given groups; links inside a group stay
    /// up, links across groups are severed. Replicas not listed keep their
    /// current links.
    pub fn partition(&self, groups: &[&[ReplicaId]]) {
        let mut state = self.locked();
        for (i, group) in groups.iter().enumerate() {
            for other_group in groups.iter().skip(i + 1) {
                for &a in group.iter() {
                    for &b in other_group.iter() {
                        state.severed.insert((a, b));
                        state.severed.insert((b, a));
                    }
                }
            }
            for &a in group.iter() {
                for &b in group.iter() {
                    state.severed.remove(&(a, b));
                }
            }
        }
    }

    /// Restores all links.
    pub fn heal(&self) {
        self.locked().severed.clear();
    }

    /// Fraction of messages (requests and replies independently) lost at
    /// random, for unreliable-network runs. Zero by default.
    pub fn set_drop_fraction(&self, fraction: f64) {
        self.locked().drop_fraction = fraction;
    }

    fn route(&self, from: ReplicaId, to: ReplicaId) -> Result<Arc<dyn RaftRpcHandler>, RpcError> {
        let state = self.locked();
        if state.severed.contains(&(from, to)) {
            return Err(RpcError::Unreachable);
        }
        if state.drop_fraction > 0.0 && rand::thread_rng().gen::<f64>() < state.drop_fraction {
            return Err(RpcError::Unreachable);
        }
        state
            .handlers
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(RpcError::Unreachable)
    }

    /// A reply is lost if the link died while the request was in flight, or
    /// to the same random loss as requests.
    fn reply_lost(&self, from: ReplicaId, to: ReplicaId) -> bool {
        let state = self.locked();
        if state.severed.contains(&(to, from)) {
            return true;
        }
        state.drop_fraction > 0.0 && rand::thread_rng().gen::<f64>() < state.drop_fraction
    }
}

struct Endpoint {
    net: Arc<InMemoryNetwork>,
    me: ReplicaId,
}

#[async_trait]
impl PeerTransport for Endpoint {
    async fn request_vote(&self, to: ReplicaId, args: RequestVoteArgs) -> Result<RequestVoteReply, RpcError> {
        let handler = self.net.route(self.me, to)?;
        tokio::task::yield_now().await;
        let reply = handler.handle_request_vote(args);
        if self.net.reply_lost(self.me, to) {
            return Err(RpcError::Unreachable);
        }
        Ok(reply)
    }

    async fn append_entries(
        &self,
        to: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError> {
        let handler = self.net.route(self.me, to)?;
        tokio::task::yield_now().await;
        let reply = handler.handle_append_entries(args);
        if self.net.reply_lost(self.me, to) {
            return Err(RpcError::Unreachable);
        }
        Ok(reply)
    }

    async fn install_snapshot(
        &self,
        to: ReplicaId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RpcError> {
        let handler = self.net.route(self.me, to)?;
        tokio::task::yield_now().await;
        let reply = handler.handle_install_snapshot(args);
        if self.net.reply_lost(self.me, to) {
            return Err(RpcError::Unreachable);
        }
        Ok(reply)
    }
}
