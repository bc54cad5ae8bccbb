//! Row enumerations with MoveNext semantics: the first call positions on
//! the first hit, `None` ends the scan.  Long scans emit a warning trace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use replikv_engine::cursor::Cursor;
use replikv_engine::error::engine_to_store_error;
use replikv_engine::kernel::Row;
use replikv_engine::session::Session;
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::StoreResult;

/// Forward scan of the primary index from `(type, key_start)`.
pub struct PrimaryEnumeration {
    cursor: Cursor,
    row_type: String,
    strict_type: bool,
    started: Instant,
    rows: usize,
    threshold: Duration,
}

impl PrimaryEnumeration {
    pub(crate) fn open(
        session: Arc<Session>,
        row_type: &str,
        key_start: &str,
        strict_type: bool,
        threshold: Duration,
    ) -> StoreResult<Self> {
        let cursor =
            Cursor::seek_primary(session, row_type, key_start).map_err(engine_to_store_error)?;
        Ok(Self {
            cursor,
            row_type: row_type.to_string(),
            strict_type,
            started: Instant::now(),
            rows: 0,
            threshold,
        })
    }

    pub fn move_next(&mut self) -> StoreResult<Option<Row>> {
        match self.cursor.move_next().map_err(engine_to_store_error)? {
            Some(row) => {
                if self.strict_type && row.row_type != self.row_type {
                    return Ok(None);
                }
                self.rows += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

impl Drop for PrimaryEnumeration {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed > self.threshold {
            warn!(
                rows = self.rows,
                elapsed_ms = elapsed.as_millis() as u64,
                row_type = %self.row_type,
                "slow primary enumeration"
            );
        }
    }
}

/// Forward scan of the LSN index from `from` (inclusive).
pub struct LsnEnumeration {
    cursor: Cursor,
    started: Instant,
    rows: usize,
    threshold: Duration,
}

impl LsnEnumeration {
    pub(crate) fn open(
        session: Arc<Session>,
        from: Lsn,
        threshold: Duration,
    ) -> StoreResult<Self> {
        let cursor = Cursor::seek_lsn(session, from).map_err(engine_to_store_error)?;
        Ok(Self {
            cursor,
            started: Instant::now(),
            rows: 0,
            threshold,
        })
    }

    pub fn move_next(&mut self) -> StoreResult<Option<Row>> {
        let row = self.cursor.move_next().map_err(engine_to_store_error)?;
        if row.is_some() {
            self.rows += 1;
        }
        Ok(row)
    }
}

impl Drop for LsnEnumeration {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed > self.threshold {
            warn!(
                rows = self.rows,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow LSN enumeration"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::LocalStoreSettings;
    use crate::store::LocalStore;
    use crate::SEQUENCE_NUMBER_IGNORE;
    use replikv_engine::instance::InstanceRegistry;

    #[tokio::test]
    async fn prefix_and_strict_enumeration() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::init(4);
        let store = LocalStore::open(
            registry.clone(),
            tmp.path(),
            LocalStoreSettings::default(),
            None,
        )
        .unwrap();

        let tx = store.create_transaction().unwrap();
        for (t, k, lsn) in [("A", "x", 1), ("T", "a1", 2), ("T", "a2", 3), ("U", "z", 4)] {
            store.insert(&tx, t, k, &[lsn as u8], lsn, None).unwrap();
        }
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();

        let tx = store.create_transaction().unwrap();

        let mut strict = store.enumerate_by_type_and_key(&tx, "T", "", true).unwrap();
        let mut keys = Vec::new();
        while let Some(row) = strict.move_next().unwrap() {
            keys.push(row.key);
        }
        assert_eq!(keys, vec!["a1", "a2"]);

        let mut loose = store.enumerate_by_type_and_key(&tx, "T", "", false).unwrap();
        let mut types = Vec::new();
        while let Some(row) = loose.move_next().unwrap() {
            types.push(row.row_type);
        }
        assert_eq!(types, vec!["T", "T", "U"]);

        let mut by_lsn = store.enumerate_by_lsn(&tx, 3).unwrap();
        let mut lsns = Vec::new();
        while let Some(row) = by_lsn.move_next().unwrap() {
            lsns.push(row.lsn);
        }
        assert_eq!(lsns, vec![3, 4]);

        assert_eq!(store.last_change_lsn(&tx).unwrap(), 4);
        tx.rollback();

        // Uncommitted writes are visible to the writing transaction's scan.
        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "a0", &[9], 9, None).unwrap();
        store
            .delete(&tx, "T", "a1", SEQUENCE_NUMBER_IGNORE)
            .unwrap();
        let mut scan = store.enumerate_by_type_and_key(&tx, "T", "", true).unwrap();
        let mut keys = Vec::new();
        while let Some(row) = scan.move_next().unwrap() {
            keys.push(row.key);
        }
        assert_eq!(keys, vec!["a0", "a2"]);
        drop(scan);
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }
}
