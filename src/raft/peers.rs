use serde::{Deserialize, Serialize};
use std::fmt;

/// ReplicaId identifies one member of the replication cluster. The member set
/// is fixed at startup; ids only need to be unique within a cluster.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ReplicaId(u64);

impl ReplicaId {
    pub fn new(id: u64) -> Self {
        ReplicaId(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
