use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one client of the key-value service. Together with a
/// monotonically increasing per-client sequence number it lets every replica
/// recognize retried requests.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum Op {
    Get,
    Put,
    Append,
}

/// The payload that travels through the replicated log. Raft treats it as
/// opaque bytes; both ends of the apply stream speak this type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Command {
    pub(crate) op: Op,
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) cid: ClientId,
    pub(crate) seq: u64,
}

impl Command {
    pub(crate) fn encode(&self) -> Bytes {
        Bytes::from(bincode::serialize(self).expect("kv command is always encodable"))
    }

    pub(crate) fn decode(blob: &Bytes) -> Result<Command, bincode::Error> {
        bincode::deserialize(blob)
    }
}

#[derive(Clone, Debug)]
pub struct GetArgs {
    pub key: String,
    pub cid: ClientId,
    pub seq: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GetReply {
    Value(String),
    NoKey,
    /// Ask another replica; leadership is elsewhere or was lost while
    /// waiting.
    WrongLeader,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Clone, Debug)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub cid: ClientId,
    pub seq: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutAppendReply {
    Ok,
    WrongLeader,
}
