//! Primary-side copy stream production.
//!
//! Builds the operation stream a joining secondary consumes: a prologue
//! (progress vector, low watermark, optional epoch history) followed by
//! either paged row enumeration (logical copy) or chunked archive payloads
//! (file-stream physical copy).  Logical enumeration holds the
//! low-watermark read lock so tombstone cleanup cannot prune rows an
//! in-flight copy expects to observe.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, info};

use replikv_copier::manager::{FileStreamFullCopyContext, FileStreamFullCopyManager};
use replikv_copier::CopyContextData;
use replikv_local_store::{LsnEnumeration, StoreTransaction};
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::wire::{
    encode_operations, CopyOperationKind, CopyType, OperationMetadata, ReplicationOpKind,
    ReplicationOperation,
};

use crate::context::ReplicaContext;
use crate::epoch_store;
use crate::settings::FullCopyMode;
use crate::tombstone;
use crate::well_known;

/// How the primary will bring this secondary up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyPlan {
    /// Secondary is already caught up; empty stream.
    None,
    LogicalFull,
    /// Apply rows on top of existing state, starting past the secondary's
    /// last LSN.
    LogicalPartial { from_lsn: Lsn },
    FileStream,
}

/// Chooses the copy plan from the secondary's copy context and the
/// primary's settings.
pub fn choose_copy_plan(
    ctx: &ReplicaContext,
    copy_context: &CopyContextData,
    up_to_lsn: Lsn,
    low_watermark: Lsn,
) -> CopyPlan {
    if copy_context.last_operation_lsn >= up_to_lsn && copy_context.last_operation_lsn > 0 {
        return CopyPlan::None;
    }

    // A partial copy is only sound while the tombstones covering the
    // secondary's gap still exist.
    if copy_context.last_operation_lsn > 0 && copy_context.last_operation_lsn >= low_watermark {
        return CopyPlan::LogicalPartial {
            from_lsn: copy_context.last_operation_lsn + 1,
        };
    }

    match ctx.settings.full_copy_mode {
        FullCopyMode::Logical => CopyPlan::LogicalFull,
        FullCopyMode::FileStream if copy_context.is_file_stream_full_copy_supported => {
            CopyPlan::FileStream
        }
        FullCopyMode::FileStream => CopyPlan::LogicalFull,
        FullCopyMode::Default => CopyPlan::LogicalFull,
    }
}

enum Stage {
    ProgressVector,
    LowWatermark,
    EpochHistory,
    Pages,
    FileStream,
    Done,
}

/// One produced copy operation: encoded metadata plus one data buffer.
pub struct CopyOperation {
    pub metadata: OperationMetadata,
    pub data: Bytes,
}

pub struct CopyOperationEnumerator {
    ctx: Arc<ReplicaContext>,
    plan: CopyPlan,
    up_to_lsn: Lsn,
    stage: Stage,
    first_tag_sent: bool,
    /// Snapshot transaction pinned for the whole enumeration.
    enumeration: Option<LsnEnumeration>,
    tx: Option<StoreTransaction>,
    _low_watermark_guard: Option<OwnedRwLockReadGuard<()>>,
    archive: Option<Arc<FileStreamFullCopyContext>>,
    archive_manager: Option<Arc<FileStreamFullCopyManager>>,
    low_watermark: Lsn,
}

impl CopyOperationEnumerator {
    pub async fn create(
        ctx: Arc<ReplicaContext>,
        copy_context: CopyContextData,
        up_to_lsn: Lsn,
        archive_manager: Arc<FileStreamFullCopyManager>,
    ) -> StoreResult<Self> {
        let guard = ctx.low_watermark_lock.clone().read_owned().await;

        let tx = ctx.local_store().create_transaction()?;
        let low_watermark = tombstone::read_low_watermark(&ctx.local_store(), &tx)?;
        let plan = choose_copy_plan(&ctx, &copy_context, up_to_lsn, low_watermark);
        info!(?plan, up_to_lsn, secondary = copy_context.replica_id, "copy plan chosen");

        let mut this = Self {
            ctx,
            plan,
            up_to_lsn,
            stage: Stage::ProgressVector,
            first_tag_sent: false,
            enumeration: None,
            tx: Some(tx),
            _low_watermark_guard: Some(guard),
            archive: None,
            archive_manager: None,
            low_watermark,
        };

        match plan {
            CopyPlan::None => {
                this.stage = Stage::Done;
                this.release_transaction();
            }
            CopyPlan::FileStream => {
                let archive = archive_manager.get_copy_context(up_to_lsn).await?;
                this.archive = Some(archive);
                this.archive_manager = Some(archive_manager);
                this.stage = Stage::FileStream;
                // Physical copies carry their bookkeeping rows inside the
                // archived database files.
                this.release_transaction();
            }
            CopyPlan::LogicalFull | CopyPlan::LogicalPartial { .. } => {}
        }

        Ok(this)
    }

    fn release_transaction(&mut self) {
        self.enumeration = None;
        if let Some(tx) = self.tx.take() {
            tx.rollback();
        }
    }

    fn first_copy_type(&self) -> CopyType {
        match self.plan {
            CopyPlan::LogicalFull => CopyType::FirstFullCopy,
            CopyPlan::LogicalPartial { .. } => CopyType::FirstPartialCopy,
            CopyPlan::FileStream => CopyType::FileStreamFullCopy,
            CopyPlan::None => CopyType::None,
        }
    }

    fn tag(&mut self) -> CopyType {
        if self.first_tag_sent {
            match self.plan {
                CopyPlan::FileStream => CopyType::FileStreamFullCopy,
                _ => CopyType::PagedCopy,
            }
        } else {
            self.first_tag_sent = true;
            self.first_copy_type()
        }
    }

    /// Produces the next operation; `None` terminates the stream.
    pub async fn get_next(&mut self) -> StoreResult<Option<CopyOperation>> {
        loop {
            match self.stage {
                Stage::Done => return Ok(None),
                Stage::ProgressVector => {
                    self.stage = Stage::LowWatermark;
                    let tx = self.tx.as_ref().ok_or(StoreError::TransactionNotActive)?;
                    let history = epoch_store::read_epoch_history(&self.ctx.local_store(), tx)?;
                    let copy_type = self.tag();
                    return Ok(Some(CopyOperation {
                        metadata: OperationMetadata::Copy {
                            kind: CopyOperationKind::ProgressVector,
                            copy_type,
                            lsn: self.up_to_lsn,
                        },
                        data: Bytes::from(epoch_store::encode_vector(&history)?),
                    }));
                }
                Stage::LowWatermark => {
                    self.stage = Stage::EpochHistory;
                    let copy_type = self.tag();
                    let encoded = bincode::serialize(&self.low_watermark)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    return Ok(Some(CopyOperation {
                        metadata: OperationMetadata::Copy {
                            kind: CopyOperationKind::LowWatermark,
                            copy_type,
                            lsn: self.up_to_lsn,
                        },
                        data: Bytes::from(encoded),
                    }));
                }
                Stage::EpochHistory => {
                    self.stage = Stage::Pages;
                    let tx = self.tx.as_ref().ok_or(StoreError::TransactionNotActive)?;
                    let history = epoch_store::read_epoch_history(&self.ctx.local_store(), tx)?;
                    if history.is_empty() {
                        continue;
                    }
                    let copy_type = self.tag();
                    return Ok(Some(CopyOperation {
                        metadata: OperationMetadata::Copy {
                            kind: CopyOperationKind::EpochHistory,
                            copy_type,
                            lsn: self.up_to_lsn,
                        },
                        data: Bytes::from(epoch_store::encode_vector(&history)?),
                    }));
                }
                Stage::Pages => {
                    let page = self.next_page()?;
                    match page {
                        Some((operations, page_max_lsn)) => {
                            let copy_type = self.tag();
                            return Ok(Some(CopyOperation {
                                metadata: OperationMetadata::Copy {
                                    kind: CopyOperationKind::Page,
                                    copy_type,
                                    lsn: page_max_lsn,
                                },
                                data: encode_operations(&operations),
                            }));
                        }
                        None => {
                            self.stage = Stage::Done;
                            self.release_transaction();
                            return Ok(None);
                        }
                    }
                }
                Stage::FileStream => {
                    let archive = self
                        .archive
                        .as_ref()
                        .ok_or_else(|| StoreError::Unexpected("archive missing".into()))?;
                    match archive.read_next_chunk(self.ctx.settings.file_stream_chunk_size)? {
                        Some((chunk, offset)) => {
                            let copy_type = self.tag();
                            return Ok(Some(CopyOperation {
                                metadata: OperationMetadata::Copy {
                                    kind: CopyOperationKind::FileStream,
                                    copy_type,
                                    lsn: offset as Lsn,
                                },
                                data: chunk.encode(),
                            }));
                        }
                        None => {
                            self.stage = Stage::Done;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    fn next_page(&mut self) -> StoreResult<Option<(Vec<ReplicationOperation>, Lsn)>> {
        if self.enumeration.is_none() {
            let from = match self.plan {
                CopyPlan::LogicalPartial { from_lsn } => from_lsn,
                _ => 1,
            };
            let tx = self.tx.as_ref().ok_or(StoreError::TransactionNotActive)?;
            self.enumeration = Some(self.ctx.local_store().enumerate_by_lsn(tx, from)?);
        }
        let enumeration = self.enumeration.as_mut().unwrap();

        let mut operations = Vec::new();
        let mut page_max_lsn = 0;
        while operations.len() < self.ctx.settings.copy_page_row_count {
            let Some(row) = enumeration.move_next()? else {
                break;
            };
            if well_known::is_copy_excluded(&row.row_type) {
                continue;
            }
            page_max_lsn = page_max_lsn.max(row.lsn);
            operations.push(ReplicationOperation {
                kind: ReplicationOpKind::Insert,
                row_type: row.row_type,
                key: row.key,
                new_key: None,
                value: Some(row.value),
                lsn: row.lsn,
                modified_on_primary: row.modified_on_primary,
            });
        }

        if operations.is_empty() {
            debug!("logical copy enumeration complete");
            return Ok(None);
        }
        Ok(Some((operations, page_max_lsn)))
    }
}

impl Drop for CopyOperationEnumerator {
    fn drop(&mut self) {
        self.release_transaction();
        if let (Some(archive), Some(manager)) = (self.archive.take(), self.archive_manager.take())
        {
            manager.release_copy_context(archive);
        }
    }
}
