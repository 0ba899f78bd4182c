use crate::api::{ApplyMsg, ApplyReceiver, InvalidOptions, RaftOptions, RaftOptionsValidated};
use crate::kv::command::{Command, GetArgs, GetReply, Op, PutAppendArgs, PutAppendOp, PutAppendReply};
use crate::kv::ClientId;
use crate::net::PeerTransport;
use crate::raft::{LogIndex, Persister, Replica, ReplicaConfig, ReplicaId, Term};
use bytes::Bytes;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

/// Take a snapshot once the persisted raft state reaches this fraction of
/// the configured maximum.
const SNAPSHOT_THRESHOLD: f64 = 0.8;

pub struct KvConfig {
    pub me: ReplicaId,
    /// The other members of the cluster.
    pub peers: Vec<ReplicaId>,
    pub transport: Arc<dyn PeerTransport>,
    pub persister: Arc<dyn Persister>,
    /// Snapshot once the persisted raft state nears this many bytes. None
    /// disables snapshotting entirely.
    pub max_raft_state: Option<usize>,
    pub options: RaftOptions,
    pub logger: slog::Logger,
}

/// The linearizable key-value service hosted on one replica. Requests are
/// proposed through the replication core and answered once the resulting
/// apply comes back around; retried requests are de-duplicated by
/// `(client, seq)`.
pub struct KvServer {
    raft: Arc<Replica>,
    kv_state: Mutex<KvState>,
    killed: AtomicBool,
    persister: Arc<dyn Persister>,
    max_raft_state: Option<usize>,
    wait_timeout: Duration,
    logger: slog::Logger,
}

struct KvState {
    store: HashMap<String, String>,
    /// Highest sequence number applied per client.
    client_seq: HashMap<ClientId, u64>,
    /// Requests parked until their command comes back on the apply stream.
    waiters: HashMap<(ClientId, u64), Vec<oneshot::Sender<ApplyOutcome>>>,
    /// Where the state machine is, surfaced to the replication core when a
    /// snapshot is cut.
    last_applied_index: LogIndex,
    last_applied_term: Term,
}

/// What an awakened waiter learns: the value under the command's key at
/// apply time. Present for existing keys, None otherwise; put/append
/// waiters ignore it.
struct ApplyOutcome {
    value: Option<String>,
}

impl KvServer {
    /// Builds the service and its replication core and spawns the apply
    /// consumer. Must be called from within a tokio runtime.
    pub fn new(config: KvConfig) -> Result<Arc<Self>, InvalidOptions> {
        let validated = RaftOptionsValidated::try_from(config.options.clone())?;
        let logger = config.logger.new(slog::o!("kv" => config.me.into_inner()));

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let raft = Replica::new(ReplicaConfig {
            me: config.me,
            peers: config.peers,
            transport: config.transport,
            persister: Arc::clone(&config.persister),
            apply_tx,
            options: config.options,
            logger: config.logger,
        })?;

        let server = Arc::new(KvServer {
            raft,
            kv_state: Mutex::new(KvState {
                store: HashMap::new(),
                client_seq: HashMap::new(),
                waiters: HashMap::new(),
                last_applied_index: LogIndex::ZERO,
                last_applied_term: Term::default(),
            }),
            killed: AtomicBool::new(false),
            persister: config.persister,
            max_raft_state: config.max_raft_state,
            wait_timeout: validated.client_wait_timeout,
            logger,
        });

        tokio::spawn(Arc::clone(&server).run_apply_consumer(apply_rx));

        Ok(server)
    }

    /// The replication core under this service, mainly for wiring it into a
    /// transport and for inspecting election state.
    pub fn raft(&self) -> &Arc<Replica> {
        &self.raft
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.raft.kill();
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn locked(&self) -> MutexGuard<'_, KvState> {
        self.kv_state.lock().expect("kv state lock poisoned")
    }

    /// Returns None when the client has already moved past `seq`; there is
    /// no one left to answer.
    pub async fn get(&self, args: GetArgs) -> Option<GetReply> {
        let rx = {
            let mut st = self.locked();
            if args.seq < st.client_seq.get(&args.cid).copied().unwrap_or(0) {
                return None;
            }
            let command = Command {
                op: Op::Get,
                key: args.key,
                value: String::new(),
                cid: args.cid,
                seq: args.seq,
            };
            if self.raft.propose(command.encode()).is_err() {
                return Some(GetReply::WrongLeader);
            }
            self.register_waiter(&mut st, args.cid, args.seq)
        };

        match timeout(self.wait_timeout, rx).await {
            Ok(Ok(outcome)) => match outcome.value {
                Some(value) => Some(GetReply::Value(value)),
                None => Some(GetReply::NoKey),
            },
            // Timed out or superseded; leadership may have moved on. The
            // client retries elsewhere and de-duplication keeps it safe.
            _ => Some(GetReply::WrongLeader),
        }
    }

    /// Returns None when the client has already moved past `seq`.
    pub async fn put_append(&self, args: PutAppendArgs) -> Option<PutAppendReply> {
        let rx = {
            let mut st = self.locked();
            if args.seq < st.client_seq.get(&args.cid).copied().unwrap_or(0) {
                return None;
            }
            let command = Command {
                op: match args.op {
                    PutAppendOp::Put => Op::Put,
                    PutAppendOp::Append => Op::Append,
                },
                key: args.key,
                value: args.value,
                cid: args.cid,
                seq: args.seq,
            };
            if self.raft.propose(command.encode()).is_err() {
                return Some(PutAppendReply::WrongLeader);
            }
            self.register_waiter(&mut st, args.cid, args.seq)
        };

        match timeout(self.wait_timeout, rx).await {
            Ok(Ok(_)) => Some(PutAppendReply::Ok),
            _ => Some(PutAppendReply::WrongLeader),
        }
    }

    fn register_waiter(
        &self,
        st: &mut KvState,
        cid: ClientId,
        seq: u64,
    ) -> oneshot::Receiver<ApplyOutcome> {
        let (tx, rx) = oneshot::channel();
        st.waiters.entry((cid, seq)).or_default().push(tx);
        rx
    }

    async fn run_apply_consumer(self: Arc<Self>, mut apply_rx: ApplyReceiver) {
        while let Some(msg) = apply_rx.recv().await {
            if self.is_killed() {
                return;
            }
            match msg {
                ApplyMsg::Command { command, index, term } => {
                    self.apply_command(&command, index, term);
                    self.maybe_take_snapshot();
                }
                ApplyMsg::Snapshot { data } => {
                    let mut st = self.locked();
                    self.restore_snapshot(&mut st, &data);
                }
            }
        }
    }

    fn apply_command(&self, blob: &Bytes, index: LogIndex, term: Term) {
        let cmd = match Command::decode(blob) {
            Ok(cmd) => cmd,
            Err(err) => {
                slog::error!(self.logger, "undecodable command in log, skipping";
                    "index" => index.val(), "err" => %err);
                return;
            }
        };

        let mut st = self.locked();
        let applied_seq = st.client_seq.get(&cmd.cid).copied().unwrap_or(0);
        if cmd.seq > applied_seq {
            match cmd.op {
                Op::Get => {}
                Op::Put => {
                    st.store.insert(cmd.key.clone(), cmd.value.clone());
                }
                Op::Append => {
                    st.store.entry(cmd.key.clone()).or_default().push_str(&cmd.value);
                }
            }
            st.client_seq.insert(cmd.cid, cmd.seq);
            st.last_applied_index = index;
            st.last_applied_term = term;
        }
        // A duplicate still answers whoever is waiting on this (cid, seq);
        // the retried command reached the log even though its effect was
        // already in.
        if let Some(waiters) = st.waiters.remove(&(cmd.cid, cmd.seq)) {
            let value = st.store.get(&cmd.key).cloned();
            for tx in waiters {
                let _ = tx.send(ApplyOutcome { value: value.clone() });
            }
        }
        // Drop superseded waiters so their clients hear back promptly
        // instead of waiting out the timeout.
        st.waiters.retain(|&(cid, seq), _| cid != cmd.cid || seq >= cmd.seq);
    }

    fn maybe_take_snapshot(&self) {
        let max = match self.max_raft_state {
            Some(max) => max,
            None => return,
        };
        if (self.persister.raft_state_size() as f64) <= (max as f64) * SNAPSHOT_THRESHOLD {
            return;
        }

        let (index, term, snapshot) = {
            let st = self.locked();
            if st.last_applied_index == LogIndex::ZERO {
                return;
            }
            let blob = bincode::serialize(&(&st.store, &st.client_seq))
                .expect("kv snapshot is always encodable");
            (st.last_applied_index, st.last_applied_term, Bytes::from(blob))
        };
        self.raft.take_snapshot(index, term, snapshot);
        slog::debug!(self.logger, "cut snapshot"; "through" => index.val());
    }

    fn restore_snapshot(&self, st: &mut KvState, data: &Bytes) {
        if data.is_empty() {
            return;
        }
        type Wire = (HashMap<String, String>, HashMap<ClientId, u64>);
        match bincode::deserialize::<Wire>(data) {
            Ok((store, client_seq)) => {
                st.store = store;
                st.client_seq = client_seq;
            }
            Err(err) => {
                slog::error!(self.logger, "cannot decode snapshot, keeping current state"; "err" => %err);
            }
        }
    }
}
