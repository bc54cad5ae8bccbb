//! Full copy (logical and file-stream) and backup/restore scenarios.

mod common;

use std::sync::Arc;

use common::{wait_until, Fixture};
use replikv_engine::instance::BackupMode;
use replikv_engine::kernel::Row;
use replikv_local_store::SEQUENCE_NUMBER_IGNORE;
use replikv_replica::settings::FullCopyMode;
use replikv_replica::store::ReplicatedStore;
use replikv_replica::StoreState;

async fn seed_primary(primary: &Arc<ReplicatedStore>, rows: u8) {
    for i in 0..rows {
        let tx = primary.create_transaction().unwrap();
        tx.insert("T", &format!("k{i:02}"), &[i]).unwrap();
        tx.commit(None).await.unwrap();
    }
}

fn user_rows(store: &Arc<ReplicatedStore>) -> Vec<Row> {
    store.enumerate("T", "").unwrap()
}

/// Collects the primary's copy stream into preloadable operations.
async fn collect_copy_ops(
    primary: &Arc<ReplicatedStore>,
    secondary: &Arc<ReplicatedStore>,
) -> Vec<(bytes::Bytes, Vec<bytes::Bytes>)> {
    let copy_context = secondary.get_copy_context().unwrap();
    let mut enumerator = primary.create_copy_enumerator(copy_context).await.unwrap();
    let mut ops = Vec::new();
    while let Some(op) = enumerator.get_next().await.unwrap() {
        ops.push((op.metadata.encode(), vec![op.data]));
    }
    ops
}

/// Property 5: copy stream + replication tail reproduce the primary's
/// state on the secondary.
#[tokio::test(flavor = "multi_thread")]
async fn logical_full_copy_then_replication_converges() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    let (primary, _pt) = fixture.open_primary(&tmp.path().join("p"), 1).await;

    seed_primary(&primary, 6).await;
    let tx = primary.create_transaction().unwrap();
    tx.delete("T", "k01", SEQUENCE_NUMBER_IGNORE).unwrap();
    tx.commit(None).await.unwrap();

    let copy_lsn = primary.last_committed_lsn().unwrap();

    // Secondary joins: copy stream first, then the replication tail.
    let (secondary, st) = fixture
        .open_replica(&tmp.path().join("s"), 2, Fixture::settings())
        .await;
    let copy_ops = collect_copy_ops(&primary, &secondary).await;
    assert!(!copy_ops.is_empty());
    st.set_copy_operations(copy_ops);
    st.set_replication_start_after(copy_lsn);

    secondary.change_to_secondary().await.unwrap();

    // More writes land while the secondary catches up.
    let tx = primary.create_transaction().unwrap();
    tx.insert("T", "tail", &[0xAA]).unwrap();
    tx.commit(None).await.unwrap();
    fixture.hub.finish();

    let sm = secondary.clone();
    wait_until("secondary drain", move || {
        sm.state() == StoreState::SecondaryPassive
    })
    .await;

    let primary_rows = user_rows(&primary);
    let secondary_rows = user_rows(&secondary);
    assert_eq!(primary_rows.len(), 6); // 6 seeded - 1 deleted + 1 tail
    assert_eq!(
        primary_rows
            .iter()
            .map(|r| (r.key.clone(), r.value.clone(), r.lsn))
            .collect::<Vec<_>>(),
        secondary_rows
            .iter()
            .map(|r| (r.key.clone(), r.value.clone(), r.lsn))
            .collect::<Vec<_>>()
    );
    assert_eq!(
        primary.last_committed_lsn().unwrap(),
        secondary.last_committed_lsn().unwrap()
    );

    secondary.close().await.unwrap();
    primary.close().await.unwrap();
    fixture.registry.shutdown();
}

/// File-stream physical copy: the secondary rebuilds its database from
/// the chunked archive.
#[tokio::test(flavor = "multi_thread")]
async fn file_stream_full_copy_rebuilds_secondary() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();

    let mut settings = Fixture::settings();
    settings.full_copy_mode = FullCopyMode::FileStream;
    settings.file_stream_chunk_size = 128;
    let (primary, _pt) = fixture
        .open_replica(&tmp.path().join("p"), 1, settings)
        .await;
    primary.change_to_primary().await.unwrap();

    // Values that do not compress away, so the archive spans chunks.
    let mut state = 0x12345678u32;
    for i in 0..10u8 {
        let value: Vec<u8> = (0..100)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let tx = primary.create_transaction().unwrap();
        tx.insert("T", &format!("k{i:02}"), &value).unwrap();
        tx.commit(None).await.unwrap();
    }
    let copy_lsn = primary.last_committed_lsn().unwrap();

    let (secondary, st) = fixture
        .open_replica(&tmp.path().join("s"), 2, Fixture::settings())
        .await;
    let copy_ops = collect_copy_ops(&primary, &secondary).await;
    // More than one chunk proves the chunking path ran.
    assert!(copy_ops.len() > 1);
    st.set_copy_operations(copy_ops);
    st.set_replication_start_after(copy_lsn);

    secondary.change_to_secondary().await.unwrap();
    fixture.hub.finish();

    let sm = secondary.clone();
    wait_until("secondary rebuild", move || {
        sm.state() == StoreState::SecondaryPassive
    })
    .await;

    let rows = user_rows(&secondary);
    assert_eq!(rows.len(), 10);
    assert_eq!(user_rows(&primary), rows);

    // The archive cache is drained once the enumerator released it.
    assert_eq!(primary.archive_manager().archive_count(), 0);

    secondary.close().await.unwrap();
    primary.close().await.unwrap();
    fixture.registry.shutdown();
}

/// S5: restore from a full backup rewinds the store to the backup LSN.
#[tokio::test(flavor = "multi_thread")]
async fn restore_from_backup_rewinds_state() {
    let tmp = tempfile::tempdir().unwrap();
    let backup_dir = tmp.path().join("backup");
    let fixture = Fixture::new();
    let root = tmp.path().join("p");
    let (primary, _pt) = fixture.open_primary(&root, 1).await;

    seed_primary(&primary, 4).await;
    let backup_lsn = primary.last_committed_lsn().unwrap();
    primary
        .context()
        .local_store()
        .backup(&backup_dir, BackupMode::Full)
        .unwrap();

    // Ten more operations past the backup point.
    for i in 0..10 {
        let tx = primary.create_transaction().unwrap();
        tx.insert("T", &format!("late{i}"), &[0xEE]).unwrap();
        tx.commit(None).await.unwrap();
    }
    assert_eq!(primary.last_committed_lsn().unwrap(), backup_lsn + 10);

    primary.context().local_store().prepare_restore(&backup_dir).unwrap();
    primary.close().await.unwrap();

    let (reopened, _t) = fixture
        .open_replica(&root, 1, Fixture::settings())
        .await;
    assert_eq!(reopened.last_committed_lsn().unwrap(), backup_lsn);
    assert_eq!(reopened.enumerate("T", "").unwrap().len(), 4);
    assert!(reopened.enumerate("T", "late").unwrap().is_empty());

    reopened.close().await.unwrap();
    fixture.registry.shutdown();
}

/// Tombstone cleanup on the primary replicates the low watermark and
/// prunes local tombstones.
#[tokio::test(flavor = "multi_thread")]
async fn tombstone_cleanup_advances_watermark() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    let mut settings = Fixture::settings();
    settings.tombstone_retention_lsns = 2;
    let (primary, _pt) = fixture
        .open_replica(&tmp.path().join("p"), 1, settings)
        .await;
    primary.change_to_primary().await.unwrap();

    seed_primary(&primary, 4).await;
    let tx = primary.create_transaction().unwrap();
    tx.delete("T", "k00", SEQUENCE_NUMBER_IGNORE).unwrap();
    tx.commit(None).await.unwrap();
    for i in 0..4 {
        let tx = primary.create_transaction().unwrap();
        tx.insert("T", &format!("pad{i}"), &[1]).unwrap();
        tx.commit(None).await.unwrap();
    }

    let reclaimed = primary.run_tombstone_cleanup().await.unwrap();
    assert_eq!(reclaimed, 1);
    // The watermark operation went through replication.
    assert!(fixture.hub.log().len() > 9);

    primary.close().await.unwrap();
    fixture.registry.shutdown();
}
