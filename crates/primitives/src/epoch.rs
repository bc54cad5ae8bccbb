use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// Replication sequence number assigned by the transport to each committed
/// write.  Signed to match the transport contract; 0 means "none yet".
pub type Lsn = i64;

/// Reserved upper bound used for seek-last queries on the LSN index.
pub const MAX_LSN: Lsn = 0x07FF_FFFF_FFFF_FFFF;

/// Label for a segment of the replication log.  Data loss bumps the first
/// coordinate, reconfiguration bumps the second.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch {
    pub dataloss: i64,
    pub configuration: i64,
}

impl Epoch {
    pub fn new(dataloss: i64, configuration: i64) -> Self {
        Self {
            dataloss,
            configuration,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.dataloss > 0 || self.configuration > 0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataloss, self.configuration)
    }
}

/// One observed epoch and the last LSN committed under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub last_lsn: Lsn,
}

/// Ordered sequence of `(epoch, last_lsn)` marking the LSN boundary of each
/// observed epoch.  Shared shape for epoch history and the progress vector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVector {
    entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ProgressVectorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ProgressVectorEntry> {
        self.entries.last()
    }

    /// Appends an entry, enforcing strict epoch ordering and non-decreasing
    /// LSN boundaries.
    pub fn append(&mut self, entry: ProgressVectorEntry) -> StoreResult<()> {
        if let Some(last) = self.entries.last() {
            if entry.epoch <= last.epoch {
                return Err(StoreError::InvalidOperation(format!(
                    "epoch {} not greater than current {}",
                    entry.epoch, last.epoch
                )));
            }
            if entry.last_lsn < last.last_lsn {
                return Err(StoreError::InvalidOperation(format!(
                    "epoch boundary LSN moved backwards: {} < {}",
                    entry.last_lsn, last.last_lsn
                )));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drops every entry whose boundary is at or above `lsn`.  Called when
    /// recovery replays an LSN below a recorded boundary (data loss).
    /// Returns the number of truncated entries.
    pub fn truncate_from(&mut self, lsn: Lsn) -> usize {
        let keep = self
            .entries
            .iter()
            .take_while(|e| e.last_lsn < lsn)
            .count();
        let dropped = self.entries.len() - keep;
        self.entries.truncate(keep);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(d: i64, c: i64, lsn: Lsn) -> ProgressVectorEntry {
        ProgressVectorEntry {
            epoch: Epoch::new(d, c),
            last_lsn: lsn,
        }
    }

    #[test]
    fn epochs_order_lexicographically() {
        assert!(Epoch::new(1, 5) < Epoch::new(2, 0));
        assert!(Epoch::new(1, 5) < Epoch::new(1, 6));
        assert!(Epoch::new(2, 0) > Epoch::new(1, 999));
    }

    #[test]
    fn append_enforces_monotonicity() {
        let mut pv = ProgressVector::new();
        pv.append(entry(1, 1, 10)).unwrap();
        pv.append(entry(1, 2, 25)).unwrap();
        assert!(pv.append(entry(1, 2, 30)).is_err());
        assert!(pv.append(entry(1, 1, 40)).is_err());
        assert!(pv.append(entry(2, 0, 20)).is_err()); // LSN backwards
        pv.append(entry(2, 0, 25)).unwrap();
        assert_eq!(pv.entries().len(), 3);
    }

    #[test]
    fn truncate_on_backward_recovery() {
        let mut pv = ProgressVector::new();
        pv.append(entry(1, 1, 10)).unwrap();
        pv.append(entry(1, 2, 25)).unwrap();
        pv.append(entry(1, 3, 40)).unwrap();
        // Replay restarts at LSN 20: the entries with boundary >= 20 are gone.
        assert_eq!(pv.truncate_from(20), 2);
        assert_eq!(pv.entries().len(), 1);
        assert_eq!(pv.last().unwrap().last_lsn, 10);
    }
}
