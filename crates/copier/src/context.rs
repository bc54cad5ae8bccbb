//! Copy-context handshake sent from a joining secondary to the primary.

use serde::{Deserialize, Serialize};

use replikv_primitives::epoch::{Epoch, Lsn};
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::ids::ReplicaId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyContextData {
    pub id: String,
    pub is_epoch_valid: bool,
    pub epoch: Epoch,
    pub last_operation_lsn: Lsn,
    /// Whether this secondary can process a physical full copy.  The
    /// primary's settings decide whether one is actually sent, so the copy
    /// mode of a partition can be changed from the primary alone.
    pub is_file_stream_full_copy_supported: bool,
    pub replica_id: ReplicaId,
}

impl CopyContextData {
    pub fn new(
        id: impl Into<String>,
        epoch: Option<Epoch>,
        last_operation_lsn: Lsn,
        replica_id: ReplicaId,
    ) -> Self {
        Self {
            id: id.into(),
            is_epoch_valid: epoch.is_some(),
            epoch: epoch.unwrap_or_default(),
            last_operation_lsn,
            is_file_stream_full_copy_supported: true,
            replica_id,
        }
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ctx = CopyContextData::new("copy-1", Some(Epoch::new(2, 3)), 450, 7);
        let decoded = CopyContextData::decode(&ctx.encode().unwrap()).unwrap();
        assert_eq!(decoded, ctx);
        assert!(decoded.is_epoch_valid);
    }
}
