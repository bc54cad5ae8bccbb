//! Indexed cursors over a session's transaction view.
//!
//! Primary cursors merge the session's buffered writes into the committed
//! snapshot so enumerations see the transaction's own mutations.  LSN
//! cursors read the committed snapshot only; change-stream consumers open
//! them in fresh read transactions.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::kernel::{Row, RowKey, Version};
use crate::session::Session;

use replikv_primitives::epoch::Lsn;

enum Mode {
    /// Forward scan of the primary index from `start`.
    Primary { start: RowKey, pos: Option<RowKey> },
    /// Forward scan of the LSN index from `from`.
    ByLsn {
        from: Lsn,
        pos: Option<(Lsn, RowKey)>,
    },
}

pub struct Cursor {
    session: Arc<Session>,
    snapshot: Version,
    generation: u64,
    mode: Mode,
    done: bool,
}

impl Cursor {
    /// Positions before the first row with key `>= (type, key_start)`.
    pub fn seek_primary(
        session: Arc<Session>,
        row_type: &str,
        key_start: &str,
    ) -> EngineResult<Self> {
        let snapshot = session.snapshot()?;
        let generation = session.generation();
        session.cursor_opened();
        Ok(Self {
            session,
            snapshot,
            generation,
            mode: Mode::Primary {
                start: RowKey::new(row_type, key_start),
                pos: None,
            },
            done: false,
        })
    }

    /// Positions before the first row with `lsn >= from`.
    pub fn seek_lsn(session: Arc<Session>, from: Lsn) -> EngineResult<Self> {
        let snapshot = session.snapshot()?;
        let generation = session.generation();
        session.cursor_opened();
        Ok(Self {
            session,
            snapshot,
            generation,
            mode: Mode::ByLsn { from, pos: None },
            done: false,
        })
    }

    fn check_valid(&self) -> EngineResult<()> {
        if self.session.generation() != self.generation {
            // The owning transaction committed or rolled back under us.
            return Err(EngineError::NoActiveTransaction);
        }
        Ok(())
    }

    /// Advances and returns the next row, `None` at end of scan.
    pub fn move_next(&mut self) -> EngineResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.check_valid()?;

        match &mut self.mode {
            Mode::Primary { start, pos } => {
                let overlay = self.session.write_overlay();
                let kernel = self.session.kernel();
                loop {
                    let committed = kernel.next_row(self.snapshot, start, pos.as_ref());

                    let lower: Bound<&RowKey> = match pos.as_ref() {
                        Some(p) => Bound::Excluded(p),
                        None => Bound::Included(start),
                    };
                    let overlaid = overlay
                        .range::<RowKey, _>((lower, Bound::Unbounded))
                        .next()
                        .map(|(k, v)| (k.clone(), v.clone()));

                    let next_key = match (&committed, &overlaid) {
                        (None, None) => {
                            self.done = true;
                            return Ok(None);
                        }
                        (Some((ck, _)), None) => ck.clone(),
                        (None, Some((ok, _))) => ok.clone(),
                        (Some((ck, _)), Some((ok, _))) => ck.clone().min(ok.clone()),
                    };

                    *pos = Some(next_key.clone());

                    // The overlay wins at equal keys; a buffered delete
                    // suppresses the committed row.
                    let row = match overlaid {
                        Some((ok, overlay_row)) if ok == next_key => overlay_row,
                        _ => committed.map(|(_, r)| r),
                    };
                    match row {
                        Some(r) => return Ok(Some(r)),
                        None => continue,
                    }
                }
            }
            Mode::ByLsn { from, pos } => {
                match self
                    .session
                    .kernel()
                    .next_by_lsn(self.snapshot, *from, pos.as_ref())
                {
                    Some((lsn, key, row)) => {
                        *pos = Some((lsn, key));
                        Ok(Some(row))
                    }
                    None => {
                        self.done = true;
                        Ok(None)
                    }
                }
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.session.cursor_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::settings::EngineSettings;

    fn row(t: &str, k: &str, v: &[u8], lsn: Lsn) -> Row {
        Row {
            row_type: t.into(),
            key: k.into(),
            value: v.to_vec(),
            seq: lsn,
            lsn,
            modified: 0,
            modified_on_primary: 0,
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<Kernel>, Arc<Session>) {
        let kernel = Kernel::open(dir, "store", EngineSettings::default()).unwrap();
        let session = Session::new(kernel.clone());
        session.begin_transaction().unwrap();
        for (k, lsn) in [("a", 1), ("b", 2), ("d", 3)] {
            session
                .put(RowKey::new("T", k), row("T", k, &[lsn as u8], lsn))
                .unwrap();
        }
        let id = session.commit_lazy(None).unwrap();
        session.commit_durable_barrier(id).unwrap();
        (kernel, session)
    }

    #[test]
    fn primary_scan_merges_overlay() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, session) = setup(tmp.path());

        session.begin_transaction().unwrap();
        // Buffer an insert between committed rows and a delete of one.
        session
            .put(RowKey::new("T", "c"), row("T", "c", &[9], 9))
            .unwrap();
        session.remove(RowKey::new("T", "b")).unwrap();

        let mut cursor = Cursor::seek_primary(session.clone(), "T", "").unwrap();
        let mut keys = Vec::new();
        while let Some(r) = cursor.move_next().unwrap() {
            keys.push(r.key);
        }
        assert_eq!(keys, vec!["a", "c", "d"]);
        drop(cursor);
        session.rollback().unwrap();
        kernel.close(false);
    }

    #[test]
    fn cursor_invalidated_by_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, session) = setup(tmp.path());

        session.begin_transaction().unwrap();
        let mut cursor = Cursor::seek_primary(session.clone(), "T", "").unwrap();
        assert!(cursor.move_next().unwrap().is_some());
        session.rollback().unwrap();
        assert_eq!(cursor.move_next().unwrap_err(), EngineError::NoActiveTransaction);
        drop(cursor);
        kernel.close(false);
    }

    #[test]
    fn lsn_scan_starts_at_requested_lsn() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, session) = setup(tmp.path());

        session.begin_transaction().unwrap();
        let mut cursor = Cursor::seek_lsn(session.clone(), 2).unwrap();
        let mut lsns = Vec::new();
        while let Some(r) = cursor.move_next().unwrap() {
            lsns.push(r.lsn);
        }
        assert_eq!(lsns, vec![2, 3]);
        drop(cursor);
        session.rollback().unwrap();
        kernel.close(false);
    }
}
