use crate::api::{ApplyMsg, ApplySender, InvalidOptions, RaftOptions, RaftOptionsValidated};
use crate::net::{PeerTransport, RaftRpcHandler};
use crate::raft::log::{LogBuffer, LogEntry, LogIndex, Term};
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, ConflictHint, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::peers::ReplicaId;
use crate::raft::persist::{self, Persister};
use bytes::Bytes;
use rand::Rng;
use std::cmp;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader-side view of one peer's log.
#[derive(Copy, Clone, Default)]
struct PeerProgress {
    next: LogIndex,
    matched: LogIndex,
}

/// Everything the protocol mutates, behind the one replica lock. The lock is
/// taken at the top of every handler, public method, and periodic activity,
/// and released before anything that can block: RPC dispatch and sends on the
/// apply stream happen outside it.
struct RaftState {
    role: Role,
    current_term: Term,
    voted_for: Option<ReplicaId>,
    log: LogBuffer,
    commit_index: LogIndex,
    last_applied: LogIndex,
    progress: HashMap<ReplicaId, PeerProgress>,
    votes: HashSet<ReplicaId>,
    election_deadline: Instant,
    last_replication_round: Instant,
    /// Snapshot waiting to be forwarded on the apply stream, set by an
    /// incoming InstallSnapshot or by recovery at startup. The applier emits
    /// it ahead of any command.
    pending_snapshot: Option<Bytes>,
}

pub struct ReplicaConfig {
    pub me: ReplicaId,
    /// The other members of the cluster. The member set is fixed for the
    /// lifetime of the replica.
    pub peers: Vec<ReplicaId>,
    pub transport: Arc<dyn PeerTransport>,
    pub persister: Arc<dyn Persister>,
    pub apply_tx: ApplySender,
    pub options: RaftOptions,
    pub logger: slog::Logger,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("this replica is not the leader")]
    NotLeader,
    #[error("replica is shut down")]
    Shutdown,
}

/// One member of the replicated log cluster. Created with [`Replica::new`],
/// which recovers persisted state and spawns the background activities;
/// commands enter through [`Replica::propose`] and leave, committed, on the
/// apply stream.
pub struct Replica {
    me: ReplicaId,
    peers: Vec<ReplicaId>,
    raft_state: Mutex<RaftState>,
    /// Wakes the applier when `commit_index` advances or a snapshot is
    /// pending.
    apply_signal: Notify,
    apply_tx: Mutex<Option<ApplySender>>,
    killed: AtomicBool,
    transport: Arc<dyn PeerTransport>,
    persister: Arc<dyn Persister>,
    opts: RaftOptionsValidated,
    logger: slog::Logger,
}

impl Replica {
    /// Builds the replica, recovering any persisted state and snapshot, and
    /// spawns its background activities. Must be called from within a tokio
    /// runtime.
    pub fn new(config: ReplicaConfig) -> Result<Arc<Self>, InvalidOptions> {
        let opts = RaftOptionsValidated::try_from(config.options)?;
        let logger = config.logger.new(slog::o!("replica" => config.me.into_inner()));

        let mut current_term = Term::default();
        let mut voted_for = None;
        let mut log = LogBuffer::new();
        let blob = config.persister.read_raft_state();
        if !blob.is_empty() {
            match persist::decode_state(&blob) {
                Ok(recovered) => {
                    current_term = recovered.current_term;
                    voted_for = recovered.voted_for;
                    log = LogBuffer::restore(
                        recovered.entries,
                        recovered.last_included_index,
                        recovered.last_included_term,
                    );
                }
                Err(err) => {
                    // Storage corruption. Continuing with defaults is the
                    // least-bad option; the operator sees this in the logs.
                    slog::error!(logger, "cannot decode persisted raft state, starting fresh"; "err" => %err);
                }
            }
        }

        let last_included = log.last_included_index();
        let snapshot = config.persister.read_snapshot();
        let pending_snapshot = if snapshot.is_empty() { None } else { Some(snapshot) };

        let progress = config
            .peers
            .iter()
            .map(|&peer| (peer, PeerProgress::default()))
            .collect();

        let replica = Arc::new(Replica {
            me: config.me,
            peers: config.peers,
            raft_state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term,
                voted_for,
                log,
                commit_index: last_included,
                last_applied: last_included,
                progress,
                votes: HashSet::new(),
                election_deadline: Instant::now(),
                last_replication_round: Instant::now(),
                pending_snapshot,
            }),
            apply_signal: Notify::new(),
            apply_tx: Mutex::new(Some(config.apply_tx)),
            killed: AtomicBool::new(false),
            transport: config.transport,
            persister: config.persister,
            opts,
            logger,
        });

        {
            let mut st = replica.locked();
            st.election_deadline = replica.next_election_deadline();
            slog::info!(replica.logger, "replica starting";
                "term" => st.current_term.val(),
                "last_index" => st.log.last_index().val(),
                "snapshot_index" => st.log.last_included_index().val());
        }

        tokio::spawn(Arc::clone(&replica).run_election_ticker());
        tokio::spawn(Arc::clone(&replica).run_heartbeat_ticker());
        tokio::spawn(Arc::clone(&replica).run_applier());

        Ok(replica)
    }

    /// Current term and whether this replica believes it is the leader.
    pub fn state(&self) -> (Term, bool) {
        let st = self.locked();
        (st.current_term, st.role == Role::Leader)
    }

    /// Starts agreement on `command`. Non-blocking: returns the index the
    /// command will occupy if it ever commits, and the term it was proposed
    /// in. There is no promise the entry commits; callers learn the outcome
    /// from the apply stream.
    pub fn propose(self: &Arc<Self>, command: Bytes) -> Result<(LogIndex, Term), ProposeError> {
        if self.is_killed() {
            return Err(ProposeError::Shutdown);
        }
        let mut st = self.locked();
        if st.role != Role::Leader {
            return Err(ProposeError::NotLeader);
        }

        let term = st.current_term;
        let index = st.log.append(LogEntry { term, command });
        self.persist(&st);
        slog::debug!(self.logger, "accepted proposal"; "index" => index.val(), "term" => term.val());

        // A cluster of one has its majority already.
        self.try_commit(&mut st);
        // Replicate eagerly rather than waiting out the heartbeat interval.
        self.replicate_round(&mut st);

        Ok((index, term))
    }

    /// The state machine finished serializing its state through
    /// `last_included_index`; drop the covered log prefix and persist the
    /// snapshot with the trimmed raft state as one atomic write.
    pub fn take_snapshot(&self, last_included_index: LogIndex, last_included_term: Term, snapshot: Bytes) {
        let mut st = self.locked();
        if last_included_index <= st.log.last_included_index() {
            return;
        }
        st.log.compact_through(last_included_index, last_included_term);
        self.persist_with_snapshot(&st, snapshot);
        slog::debug!(self.logger, "compacted log"; "through" => last_included_index.val());
    }

    /// Signals shutdown. Background activities observe the flag and exit
    /// promptly; the apply stream is closed.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        *self.apply_tx.lock().expect("apply sender lock poisoned") = None;
        self.apply_signal.notify_one();
        slog::info!(self.logger, "replica shutting down");
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn locked(&self) -> MutexGuard<'_, RaftState> {
        self.raft_state.lock().expect("raft state lock poisoned")
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn next_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng()
            .gen_range(self.opts.election_timeout_min..=self.opts.election_timeout_max);
        Instant::now() + timeout
    }

    fn persist(&self, st: &RaftState) {
        let blob = persist::encode_state(
            st.current_term,
            st.voted_for,
            st.log.suffix(),
            st.log.last_included_index(),
            st.log.last_included_term(),
        );
        self.persister.save_raft_state(blob);
    }

    fn persist_with_snapshot(&self, st: &RaftState, snapshot: Bytes) {
        let blob = persist::encode_state(
            st.current_term,
            st.voted_for,
            st.log.suffix(),
            st.log.last_included_index(),
            st.log.last_included_term(),
        );
        self.persister.save_state_and_snapshot(blob, snapshot);
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    fn adopt_term_if_newer(&self, st: &mut RaftState, observed: Term) -> bool {
        if observed <= st.current_term {
            return false;
        }
        if st.role != Role::Follower {
            slog::info!(self.logger, "observed newer term, reverting to follower";
                "term" => observed.val(), "was" => format!("{:?}", st.role));
        }
        st.current_term = observed;
        st.voted_for = None;
        st.role = Role::Follower;
        self.persist(st);
        true
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    async fn run_election_ticker(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            {
                let mut st = self.locked();
                if st.role != Role::Leader && Instant::now() >= st.election_deadline {
                    self.start_election(&mut st);
                }
            }
            tokio::time::sleep(self.opts.heartbeat_interval).await;
        }
    }

    fn start_election(self: &Arc<Self>, st: &mut RaftState) {
        st.role = Role::Candidate;
        st.current_term = st.current_term.next();
        st.voted_for = Some(self.me);
        self.persist(st);
        st.votes.clear();
        st.votes.insert(self.me);
        st.election_deadline = self.next_election_deadline();
        slog::info!(self.logger, "election timeout, starting election"; "term" => st.current_term.val());

        if st.votes.len() >= self.majority() {
            self.become_leader(st);
            return;
        }

        let args = RequestVoteArgs {
            term: st.current_term,
            candidate_id: self.me,
            last_log_index: st.log.last_index(),
            last_log_term: st.log.last_term(),
        };
        for &peer in self.peers.iter() {
            tokio::spawn(Arc::clone(self).send_request_vote(peer, args.clone()));
        }
    }

    async fn send_request_vote(self: Arc<Self>, peer: ReplicaId, args: RequestVoteArgs) {
        let sent_term = args.term;
        let reply = match self.transport.request_vote(peer, args).await {
            Ok(reply) => reply,
            Err(err) => {
                slog::debug!(self.logger, "RequestVote dropped"; "peer" => %peer, "err" => %err);
                return;
            }
        };

        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, reply.term);
        // Election may have ended while the RPC was in flight.
        if st.current_term != sent_term || st.role != Role::Candidate {
            return;
        }
        if reply.vote_granted {
            st.votes.insert(peer);
            if st.votes.len() >= self.majority() {
                self.become_leader(&mut st);
            }
        }
    }

    fn become_leader(self: &Arc<Self>, st: &mut RaftState) {
        if st.role == Role::Leader {
            return;
        }
        st.role = Role::Leader;
        let next = st.log.last_index().plus(1);
        for progress in st.progress.values_mut() {
            progress.next = next;
            progress.matched = LogIndex::ZERO;
        }
        slog::info!(self.logger, "won election"; "term" => st.current_term.val());
        // Announce leadership without waiting for the heartbeat tick.
        self.replicate_round(st);
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    async fn run_heartbeat_ticker(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            {
                let mut st = self.locked();
                if st.role == Role::Leader
                    && st.last_replication_round.elapsed() >= self.opts.heartbeat_interval
                {
                    self.replicate_round(&mut st);
                }
            }
            tokio::time::sleep(self.opts.heartbeat_interval).await;
        }
    }

    /// One replication round: every peer gets AppendEntries from its matched
    /// position, or InstallSnapshot if what it needs was compacted away.
    fn replicate_round(self: &Arc<Self>, st: &mut RaftState) {
        let term = st.current_term;
        let leader_commit = st.commit_index;
        for (&peer, progress) in st.progress.iter() {
            if progress.matched >= st.log.last_included_index() {
                let prev = progress.matched;
                let prev_term = st
                    .log
                    .term_at(prev)
                    .expect("matched index is within the retained log");
                let args = AppendEntriesArgs {
                    term,
                    leader_id: self.me,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries: st.log.entries_after(prev),
                    leader_commit,
                };
                tokio::spawn(Arc::clone(self).send_append_entries(peer, args));
            } else {
                let args = InstallSnapshotArgs {
                    term,
                    leader_id: self.me,
                    last_included_index: st.log.last_included_index(),
                    last_included_term: st.log.last_included_term(),
                    data: self.persister.read_snapshot(),
                };
                tokio::spawn(Arc::clone(self).send_install_snapshot(peer, args));
            }
        }
        st.last_replication_round = Instant::now();
    }

    async fn send_append_entries(self: Arc<Self>, peer: ReplicaId, args: AppendEntriesArgs) {
        let sent_term = args.term;
        let prev = args.prev_log_index;
        let sent = args.entries.len() as u64;
        let reply = match self.transport.append_entries(peer, args).await {
            Ok(reply) => reply,
            Err(err) => {
                slog::trace!(self.logger, "AppendEntries dropped"; "peer" => %peer, "err" => %err);
                return;
            }
        };

        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, reply.term);
        // Term confusion guard: the reply is only meaningful if nothing
        // changed since dispatch.
        if st.current_term != sent_term || st.role != Role::Leader {
            return;
        }

        if reply.success {
            let matched = prev.plus(sent);
            if let Some(progress) = st.progress.get_mut(&peer) {
                progress.matched = matched;
                progress.next = matched.plus(1);
            }
            self.try_commit(&mut st);
        } else if let Some(hint) = reply.conflict {
            let next = Self::rollback_next_index(&st.log, hint);
            if let Some(progress) = st.progress.get_mut(&peer) {
                progress.next = next;
                progress.matched = next.prev();
            }
            slog::debug!(self.logger, "log conflict, rolling back peer";
                "peer" => %peer, "next" => next.val());
        }
    }

    /// Where to back `next_index` up to, given a follower's conflict hint:
    /// to the end of a too-short follower log; to our last entry of the
    /// conflicting term if we have that term; else to the follower's first
    /// index of that term, skipping the whole run in one step.
    fn rollback_next_index(log: &LogBuffer, hint: ConflictHint) -> LogIndex {
        match hint.term {
            None => LogIndex::new(hint.log_len),
            Some(term) => match log.last_index_with_term(term) {
                Some(index) => index,
                None => hint.first_index,
            },
        }
    }

    /// Advances `commit_index` to the highest N replicated on a majority
    /// with `log[N].term == current_term`. Counting replicas alone is not
    /// enough for entries from earlier terms (§5.4.2).
    fn try_commit(&self, st: &mut RaftState) {
        let mut n = st.log.last_index();
        while n > st.commit_index && n > st.log.last_included_index() {
            let replicated = 1 + st.progress.values().filter(|p| p.matched >= n).count();
            if replicated >= self.majority() && st.log.term_at(n) == Some(st.current_term) {
                st.commit_index = n;
                self.apply_signal.notify_one();
                slog::debug!(self.logger, "advanced commit index"; "commit" => n.val());
                break;
            }
            n = n.prev();
        }
    }

    async fn send_install_snapshot(self: Arc<Self>, peer: ReplicaId, args: InstallSnapshotArgs) {
        let sent_term = args.term;
        let sent_index = args.last_included_index;
        let reply = match self.transport.install_snapshot(peer, args).await {
            Ok(reply) => reply,
            Err(err) => {
                slog::trace!(self.logger, "InstallSnapshot dropped"; "peer" => %peer, "err" => %err);
                return;
            }
        };

        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, reply.term);
        if st.current_term != sent_term || st.role != Role::Leader {
            return;
        }
        if let Some(progress) = st.progress.get_mut(&peer) {
            progress.matched = sent_index;
            progress.next = sent_index.plus(1);
        }
        self.try_commit(&mut st);
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    async fn run_applier(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }

            let batch = {
                let mut st = self.locked();
                let mut msgs = Vec::new();
                if let Some(data) = st.pending_snapshot.take() {
                    msgs.push(ApplyMsg::Snapshot { data });
                }
                while st.last_applied < st.commit_index {
                    let next = st.last_applied.plus(1);
                    let entry = st
                        .log
                        .entry_at(next)
                        .expect("committed entry missing from retained log");
                    msgs.push(ApplyMsg::Command {
                        command: entry.command.clone(),
                        index: next,
                        term: entry.term,
                    });
                    st.last_applied = next;
                }
                msgs
            };

            if batch.is_empty() {
                self.apply_signal.notified().await;
                continue;
            }

            // Emit outside the lock; the consumer may itself call back into
            // this replica.
            let tx = match self
                .apply_tx
                .lock()
                .expect("apply sender lock poisoned")
                .clone()
            {
                Some(tx) => tx,
                None => return,
            };
            for msg in batch {
                if tx.send(msg).is_err() {
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------

    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, args.term);

        // 1. Reply false if term < currentTerm (§5.1)
        if args.term < st.current_term {
            return RequestVoteReply {
                term: st.current_term,
                vote_granted: false,
            };
        }

        // 2. If votedFor is null or candidateId, and candidate's log is at
        // least as up-to-date as receiver's log, grant vote (§5.2, §5.4)
        let up_to_date =
            (args.last_log_term, args.last_log_index) >= (st.log.last_term(), st.log.last_index());
        let can_vote = match st.voted_for {
            None => true,
            Some(voted_for) => voted_for == args.candidate_id,
        };

        if !(can_vote && up_to_date) {
            return RequestVoteReply {
                term: st.current_term,
                vote_granted: false,
            };
        }

        st.voted_for = Some(args.candidate_id);
        self.persist(&st);
        // Granting a vote suppresses our own candidacy for a while.
        st.election_deadline = self.next_election_deadline();
        slog::debug!(self.logger, "granted vote"; "candidate" => %args.candidate_id, "term" => st.current_term.val());

        RequestVoteReply {
            term: st.current_term,
            vote_granted: true,
        }
    }

    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, args.term);

        // 1. Reply false if term < currentTerm (§5.1). The sender is not the
        // current leader, so no rollback hint is owed.
        if args.term < st.current_term {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
                conflict: None,
            };
        }

        // args.term >= currentTerm, so this is the current leader.
        st.election_deadline = self.next_election_deadline();

        // 2. Reply false if log doesn't contain an entry at prevLogIndex
        // whose term matches prevLogTerm (§5.3)
        let last = st.log.last_index();
        let prev_matches = if args.prev_log_index > last {
            false
        } else {
            match st.log.term_at(args.prev_log_index) {
                Some(term) => term == args.prev_log_term,
                // prevLogIndex sits inside our snapshot: that prefix is
                // committed, so it agrees with any current leader.
                None => true,
            }
        };
        if !prev_matches {
            let hint = if args.prev_log_index > last {
                ConflictHint {
                    term: None,
                    first_index: LogIndex::ZERO,
                    log_len: last.val() + 1,
                }
            } else {
                let conflicting = st
                    .log
                    .term_at(args.prev_log_index)
                    .expect("mismatch index is within the retained log");
                ConflictHint {
                    term: Some(conflicting),
                    first_index: st.log.first_index_with_term(conflicting, args.prev_log_index),
                    log_len: last.val() + 1,
                }
            };
            slog::debug!(self.logger, "rejecting AppendEntries, log mismatch";
                "leader" => %args.leader_id,
                "prev_index" => args.prev_log_index.val());
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
                conflict: Some(hint),
            };
        }

        // 3. If an existing entry conflicts with a new one (same index,
        // different terms), delete the existing entry and all that follow it
        // (§5.3)
        // 4. Append any new entries not already in the log
        let mut changed = false;
        for (i, entry) in args.entries.iter().enumerate() {
            let at = args.prev_log_index.plus(i as u64 + 1);
            if at <= st.log.last_included_index() {
                // Covered by our snapshot, hence committed and identical.
                continue;
            }
            match st.log.term_at(at) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    st.log.truncate_from(at);
                    st.log.append(entry.clone());
                    changed = true;
                }
                None => {
                    st.log.append(entry.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.persist(&st);
        }

        // 5. If leaderCommit > commitIndex, set
        // commitIndex = min(leaderCommit, index of last new entry)
        if args.leader_commit > st.commit_index {
            st.commit_index = cmp::min(args.leader_commit, st.log.last_index());
            self.apply_signal.notify_one();
        }

        AppendEntriesReply {
            term: st.current_term,
            success: true,
            conflict: None,
        }
    }

    pub fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut st = self.locked();
        self.adopt_term_if_newer(&mut st, args.term);

        if args.term < st.current_term {
            return InstallSnapshotReply {
                term: st.current_term,
            };
        }

        st.election_deadline = self.next_election_deadline();

        // A snapshot we already cover teaches us nothing.
        if args.last_included_index <= st.log.last_included_index() {
            return InstallSnapshotReply {
                term: st.current_term,
            };
        }

        slog::info!(self.logger, "installing snapshot";
            "leader" => %args.leader_id,
            "through" => args.last_included_index.val());

        st.log
            .cut_for_snapshot(args.last_included_index, args.last_included_term);
        st.last_applied = cmp::max(st.last_applied, args.last_included_index);
        st.commit_index = cmp::max(st.commit_index, args.last_included_index);
        self.persist_with_snapshot(&st, args.data.clone());

        // Hand the snapshot to the state machine via the apply stream; the
        // applier emits it outside this lock.
        st.pending_snapshot = Some(args.data);
        self.apply_signal.notify_one();

        InstallSnapshotReply {
            term: st.current_term,
        }
    }
}

impl RaftRpcHandler for Replica {
    fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        Replica::handle_request_vote(self, args)
    }

    fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        Replica::handle_append_entries(self, args)
    }

    fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        Replica::handle_install_snapshot(self, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RpcError;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// Transport for single-replica tests: every peer is unreachable.
    struct DeadTransport;

    #[async_trait]
    impl PeerTransport for DeadTransport {
        async fn request_vote(
            &self,
            _to: ReplicaId,
            _args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, RpcError> {
            Err(RpcError::Unreachable)
        }

        async fn append_entries(
            &self,
            _to: ReplicaId,
            _args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, RpcError> {
            Err(RpcError::Unreachable)
        }

        async fn install_snapshot(
            &self,
            _to: ReplicaId,
            _args: InstallSnapshotArgs,
        ) -> Result<InstallSnapshotReply, RpcError> {
            Err(RpcError::Unreachable)
        }
    }

    fn quiet_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn spawn_replica(
        me: u64,
        peers: Vec<u64>,
        persister: Arc<crate::raft::MemoryPersister>,
    ) -> (Arc<Replica>, crate::api::ApplyReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let replica = Replica::new(ReplicaConfig {
            me: ReplicaId::new(me),
            peers: peers.into_iter().map(ReplicaId::new).collect(),
            transport: Arc::new(DeadTransport),
            persister,
            apply_tx: tx,
            options: RaftOptions::default(),
            logger: quiet_logger(),
        })
        .expect("default options are valid");
        (replica, rx)
    }

    async fn wait_for_leadership(replica: &Arc<Replica>) {
        for _ in 0..100 {
            if replica.state().1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("replica never became leader");
    }

    fn entries(terms: &[u64]) -> Vec<LogEntry> {
        terms
            .iter()
            .map(|&t| LogEntry {
                term: Term::new(t),
                command: Bytes::from_static(b"x"),
            })
            .collect()
    }

    fn append_args(term: u64, prev: u64, prev_term: u64, new: &[u64], commit: u64) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term: Term::new(term),
            leader_id: ReplicaId::new(99),
            prev_log_index: LogIndex::new(prev),
            prev_log_term: Term::new(prev_term),
            entries: entries(new),
            leader_commit: LogIndex::new(commit),
        }
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        let vote = |candidate: u64| RequestVoteArgs {
            term: Term::new(5),
            candidate_id: ReplicaId::new(candidate),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::new(0),
        };

        assert!(replica.handle_request_vote(vote(2)).vote_granted);
        // Same candidate retries: still granted.
        assert!(replica.handle_request_vote(vote(2)).vote_granted);
        // Different candidate, same term: denied.
        assert!(!replica.handle_request_vote(vote(3)).vote_granted);

        replica.kill();
    }

    #[tokio::test]
    async fn denies_vote_to_stale_log() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        // Give the follower three entries through term 3.
        let reply = replica.handle_append_entries(append_args(3, 0, 0, &[1, 2, 3], 0));
        assert!(reply.success);

        // Candidate whose last entry has a lower term loses.
        let stale = RequestVoteArgs {
            term: Term::new(4),
            candidate_id: ReplicaId::new(2),
            last_log_index: LogIndex::new(5),
            last_log_term: Term::new(2),
        };
        assert!(!replica.handle_request_vote(stale).vote_granted);

        // Same last term but shorter log loses too.
        let shorter = RequestVoteArgs {
            term: Term::new(5),
            candidate_id: ReplicaId::new(2),
            last_log_index: LogIndex::new(2),
            last_log_term: Term::new(3),
        };
        assert!(!replica.handle_request_vote(shorter).vote_granted);

        // Equal logs win the benefit of the doubt.
        let equal = RequestVoteArgs {
            term: Term::new(6),
            candidate_id: ReplicaId::new(2),
            last_log_index: LogIndex::new(3),
            last_log_term: Term::new(3),
        };
        assert!(replica.handle_request_vote(equal).vote_granted);

        replica.kill();
    }

    #[tokio::test]
    async fn rejects_stale_term_without_hint() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        assert!(replica.handle_append_entries(append_args(5, 0, 0, &[5], 0)).success);

        let reply = replica.handle_append_entries(append_args(3, 1, 5, &[], 0));
        assert!(!reply.success);
        assert!(reply.conflict.is_none());
        assert_eq!(reply.term, Term::new(5));

        replica.kill();
    }

    #[tokio::test]
    async fn conflict_hints_follow_fast_rollback_protocol() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        // Follower log: terms [4, 4, 4] at indices 1..=3.
        assert!(replica.handle_append_entries(append_args(4, 0, 0, &[4, 4, 4], 0)).success);

        // Leader probes past our end: too-short hint.
        let reply = replica.handle_append_entries(append_args(6, 7, 6, &[], 0));
        assert!(!reply.success);
        let hint = reply.conflict.expect("mismatch must carry a hint");
        assert!(hint.term.is_none());
        assert_eq!(hint.log_len, 4);

        // Leader probes index 2 with a different term: conflicting-term hint
        // pointing at the first index of our term-4 run.
        let reply = replica.handle_append_entries(append_args(6, 2, 6, &[], 0));
        assert!(!reply.success);
        let hint = reply.conflict.expect("mismatch must carry a hint");
        assert_eq!(hint.term, Some(Term::new(4)));
        assert_eq!(hint.first_index, LogIndex::new(1));
        assert_eq!(hint.log_len, 4);

        replica.kill();
    }

    #[tokio::test]
    async fn conflicting_suffix_is_replaced() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        assert!(replica.handle_append_entries(append_args(4, 0, 0, &[2, 2, 4, 4], 0)).success);
        // New leader agrees through index 2, replaces the rest.
        assert!(replica.handle_append_entries(append_args(5, 2, 2, &[5, 5, 5], 0)).success);

        // Probe: entry at index 3 must now be term 5.
        let reply = replica.handle_append_entries(append_args(5, 3, 5, &[], 0));
        assert!(reply.success);
        let reply = replica.handle_append_entries(append_args(5, 5, 5, &[], 0));
        assert!(reply.success);

        replica.kill();
    }

    #[tokio::test]
    async fn duplicate_append_does_not_truncate() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        assert!(replica.handle_append_entries(append_args(2, 0, 0, &[2, 2, 2], 0)).success);
        // A delayed retransmission of a shorter prefix must not shrink the log.
        assert!(replica.handle_append_entries(append_args(2, 0, 0, &[2], 0)).success);

        let reply = replica.handle_append_entries(append_args(2, 3, 2, &[], 0));
        assert!(reply.success, "entries past the retransmission must survive");

        replica.kill();
    }

    #[tokio::test]
    async fn rollback_next_index_reactions() {
        let mut log = LogBuffer::new();
        for entry in entries(&[4, 4, 5, 5]) {
            log.append(entry);
        }

        // Follower too short.
        let next = Replica::rollback_next_index(
            &log,
            ConflictHint {
                term: None,
                first_index: LogIndex::ZERO,
                log_len: 3,
            },
        );
        assert_eq!(next, LogIndex::new(3));

        // Leader has the conflicting term: jump to its last entry of it.
        let next = Replica::rollback_next_index(
            &log,
            ConflictHint {
                term: Some(Term::new(4)),
                first_index: LogIndex::new(1),
                log_len: 5,
            },
        );
        assert_eq!(next, LogIndex::new(2));

        // Leader lacks the conflicting term: jump past the follower's run.
        let next = Replica::rollback_next_index(
            &log,
            ConflictHint {
                term: Some(Term::new(3)),
                first_index: LogIndex::new(2),
                log_len: 5,
            },
        );
        assert_eq!(next, LogIndex::new(2));
    }

    #[tokio::test]
    async fn single_replica_commits_and_applies_in_order() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, mut rx) = spawn_replica(1, vec![], persister);
        wait_for_leadership(&replica).await;

        for i in 0..3u8 {
            replica
                .propose(Bytes::copy_from_slice(&[i]))
                .expect("leader accepts proposals");
        }

        for i in 0..3u64 {
            let msg = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("apply within deadline")
                .expect("stream open");
            match msg {
                ApplyMsg::Command { index, command, .. } => {
                    assert_eq!(index, LogIndex::new(i + 1));
                    assert_eq!(command.as_ref(), &[i as u8]);
                }
                other => panic!("unexpected apply message: {:?}", other),
            }
        }

        replica.kill();
    }

    #[tokio::test]
    async fn follower_rejects_proposals() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, _rx) = spawn_replica(1, vec![2, 3], persister);

        // Not elected yet (peers unreachable, may be candidate, never leader).
        let err = replica.propose(Bytes::from_static(b"nope")).unwrap_err();
        assert!(matches!(err, ProposeError::NotLeader));

        replica.kill();
        let err = replica.propose(Bytes::from_static(b"nope")).unwrap_err();
        assert!(matches!(err, ProposeError::Shutdown));
    }

    #[tokio::test]
    async fn recovers_log_and_term_from_persister() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        {
            let (replica, mut rx) = spawn_replica(1, vec![], Arc::clone(&persister));
            wait_for_leadership(&replica).await;
            for word in [&b"a"[..], b"b", b"c"] {
                replica.propose(Bytes::copy_from_slice(word)).unwrap();
            }
            for _ in 0..3 {
                timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            }
            replica.kill();
        }

        let (replica, mut rx) = spawn_replica(1, vec![], Arc::clone(&persister));
        wait_for_leadership(&replica).await;

        let (term, _) = replica.state();
        assert!(term > Term::new(0));

        // The recovered log replays, then accepts new proposals at index 4.
        let (index, _) = replica.propose(Bytes::from_static(b"d")).unwrap();
        assert_eq!(index, LogIndex::new(4));

        let mut seen = Vec::new();
        for _ in 0..4 {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
                ApplyMsg::Command { index, .. } => seen.push(index.val()),
                other => panic!("unexpected apply message: {:?}", other),
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);

        replica.kill();
    }

    #[tokio::test]
    async fn snapshot_compacts_and_replays_on_restart() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        {
            let (replica, mut rx) = spawn_replica(1, vec![], Arc::clone(&persister));
            wait_for_leadership(&replica).await;
            for word in [&b"a"[..], b"b", b"c"] {
                replica.propose(Bytes::copy_from_slice(word)).unwrap();
            }
            let mut last_term = Term::new(0);
            for _ in 0..3 {
                if let ApplyMsg::Command { term, .. } =
                    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
                {
                    last_term = term;
                }
            }

            let size_before = persister.raft_state_size();
            replica.take_snapshot(LogIndex::new(2), last_term, Bytes::from_static(b"machine-state"));
            assert!(persister.raft_state_size() < size_before);
            assert_eq!(persister.read_snapshot(), Bytes::from_static(b"machine-state"));

            // Compacting the same prefix again is a no-op.
            replica.take_snapshot(LogIndex::new(2), last_term, Bytes::from_static(b"stale"));
            assert_eq!(persister.read_snapshot(), Bytes::from_static(b"machine-state"));

            replica.kill();
        }

        let (replica, mut rx) = spawn_replica(1, vec![], Arc::clone(&persister));

        // Recovery hands the snapshot to the state machine first.
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ApplyMsg::Snapshot { data } => assert_eq!(data, Bytes::from_static(b"machine-state")),
            other => panic!("expected snapshot first, got {:?}", other),
        }

        wait_for_leadership(&replica).await;
        let (index, _) = replica.propose(Bytes::from_static(b"d")).unwrap();
        assert_eq!(index, LogIndex::new(4));

        // Only the un-snapshotted tail replays as commands.
        let mut seen = Vec::new();
        for _ in 0..2 {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
                ApplyMsg::Command { index, .. } => seen.push(index.val()),
                other => panic!("unexpected apply message: {:?}", other),
            }
        }
        assert_eq!(seen, vec![3, 4]);

        replica.kill();
    }

    #[tokio::test]
    async fn install_snapshot_fast_forwards_follower() {
        let persister = Arc::new(crate::raft::MemoryPersister::new());
        let (replica, mut rx) = spawn_replica(1, vec![2, 3], persister);

        let reply = replica.handle_install_snapshot(InstallSnapshotArgs {
            term: Term::new(3),
            leader_id: ReplicaId::new(2),
            last_included_index: LogIndex::new(10),
            last_included_term: Term::new(2),
            data: Bytes::from_static(b"snap"),
        });
        assert_eq!(reply.term, Term::new(3));

        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ApplyMsg::Snapshot { data } => assert_eq!(data, Bytes::from_static(b"snap")),
            other => panic!("unexpected apply message: {:?}", other),
        }

        // Appending right after the snapshot succeeds.
        let reply = replica.handle_append_entries(append_args(3, 10, 2, &[3], 11));
        assert!(reply.success);
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ApplyMsg::Command { index, .. } => assert_eq!(index, LogIndex::new(11)),
            other => panic!("unexpected apply message: {:?}", other),
        }

        // An older snapshot is ignored.
        let reply = replica.handle_install_snapshot(InstallSnapshotArgs {
            term: Term::new(3),
            leader_id: ReplicaId::new(2),
            last_included_index: LogIndex::new(5),
            last_included_term: Term::new(1),
            data: Bytes::from_static(b"stale"),
        });
        assert_eq!(reply.term, Term::new(3));

        replica.kill();
    }
}
