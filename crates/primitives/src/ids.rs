use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Replica identifier assigned by the cluster host.
pub type ReplicaId = u64;

/// Identity of one replica of one partition.  Carried by every component
/// that traces per replica and used to derive on-disk directory names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionedReplicaId {
    partition: String,
    replica: ReplicaId,
}

impl PartitionedReplicaId {
    pub fn new(partition: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            partition: partition.into(),
            replica,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// `P_<partition>` directory component.
    pub fn partition_dir(&self) -> String {
        format!("P_{}", self.partition)
    }

    /// `R_<replica>` directory component, with an optional staging suffix
    /// (`F` full copy, `P` partial copy, `D` drop backup).
    pub fn replica_dir(&self, suffix: &str) -> String {
        format!("R_{}{}", self.replica, suffix)
    }
}

impl fmt::Display for PartitionedReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.replica)
    }
}

static NEXT_ACTIVITY: AtomicU64 = AtomicU64::new(1);

/// Tracing identity for one logical activity (a transaction, a copy, a
/// pump pass).  Process-unique, never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityId(u64);

impl ActivityId {
    pub fn next() -> Self {
        ActivityId(NEXT_ACTIVITY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

static NEXT_TRACKER: AtomicU64 = AtomicU64::new(1);

/// Identity assigned to every replicated-store transaction for tracking,
/// tracing, and migration mirroring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(u64);

impl TrackerId {
    pub fn next() -> Self {
        TrackerId(NEXT_TRACKER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_names() {
        let id = PartitionedReplicaId::new("7f1c", 130);
        assert_eq!(id.partition_dir(), "P_7f1c");
        assert_eq!(id.replica_dir(""), "R_130");
        assert_eq!(id.replica_dir("F"), "R_130F");
        assert_eq!(id.replica_dir("P"), "R_130P");
    }

    #[test]
    fn activity_ids_are_unique() {
        let a = ActivityId::next();
        let b = ActivityId::next();
        assert_ne!(a, b);
    }
}
