//! Base types shared by every crate in the workspace: identifiers, the
//! error taxonomy, epoch/progress-vector bookkeeping, wall-clock helpers,
//! the replication wire format, and shutdown signalling.

pub mod epoch;
pub mod errors;
pub mod ids;
pub mod shutdown;
pub mod time;
pub mod wire;

pub mod prelude {
    pub use crate::{
        epoch::{Epoch, Lsn, ProgressVector, ProgressVectorEntry, MAX_LSN},
        errors::{StoreError, StoreResult},
        ids::{ActivityId, PartitionedReplicaId, ReplicaId, TrackerId},
    };
}
