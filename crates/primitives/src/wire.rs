//! Wire format for copy and replication payloads.
//!
//! Every operation on the wire carries one metadata buffer and one or more
//! data buffers.  All integers are little-endian.  Strings travel as
//! `len:u32` followed by `len` UTF-16 code units, value blobs as `len:u32`
//! followed by raw bytes.  This layout is a compatibility contract; it is
//! encoded by hand rather than through a serde format.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::epoch::Lsn;
use crate::errors::{StoreError, StoreResult};
use crate::time::UtcTicks;

/// Kind tag of one record inside a data buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplicationOpKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
    Tombstone = 4,
    TombstoneLowWatermark = 5,
    EpochUpdate = 6,
    EpochHistory = 7,
}

impl ReplicationOpKind {
    pub fn from_u8(v: u8) -> StoreResult<Self> {
        Ok(match v {
            1 => Self::Insert,
            2 => Self::Update,
            3 => Self::Delete,
            4 => Self::Tombstone,
            5 => Self::TombstoneLowWatermark,
            6 => Self::EpochUpdate,
            7 => Self::EpochHistory,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown replication op kind {other}"
                )))
            }
        })
    }

    fn carries_value(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::EpochUpdate | Self::EpochHistory
        )
    }

    fn carries_new_key(self) -> bool {
        matches!(self, Self::Update)
    }
}

/// Kind tag of one copy-stream operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyOperationKind {
    ProgressVector = 1,
    LowWatermark = 2,
    EpochHistory = 3,
    Page = 4,
    FileStream = 5,
}

impl CopyOperationKind {
    pub fn from_u8(v: u8) -> StoreResult<Self> {
        Ok(match v {
            1 => Self::ProgressVector,
            2 => Self::LowWatermark,
            3 => Self::EpochHistory,
            4 => Self::Page,
            5 => Self::FileStream,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown copy operation kind {other}"
                )))
            }
        })
    }
}

/// Copy subtype carried in copy metadata.  `None` for steady-state page
/// operations after the first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyType {
    #[default]
    None = 0,
    FirstFullCopy = 1,
    FirstPartialCopy = 2,
    FirstSnapshotPartialCopy = 3,
    FileStreamFullCopy = 4,
    FileStreamRebuildCopy = 5,
    PagedCopy = 6,
}

impl CopyType {
    pub fn from_u8(v: u8) -> StoreResult<Self> {
        Ok(match v {
            0 => Self::None,
            1 => Self::FirstFullCopy,
            2 => Self::FirstPartialCopy,
            3 => Self::FirstSnapshotPartialCopy,
            4 => Self::FileStreamFullCopy,
            5 => Self::FileStreamRebuildCopy,
            6 => Self::PagedCopy,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown copy type {other}"
                )))
            }
        })
    }

    /// True for the tags that open a new copy destination on the secondary.
    pub fn is_first_copy(self) -> bool {
        matches!(
            self,
            Self::FirstFullCopy | Self::FirstPartialCopy | Self::FirstSnapshotPartialCopy
        )
    }

    pub fn is_file_stream(self) -> bool {
        matches!(self, Self::FileStreamFullCopy | Self::FileStreamRebuildCopy)
    }
}

/// Decoded metadata buffer of one pumped operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationMetadata {
    /// Normal replication operation (`operation_kind == 0`).
    Replication { lsn: Lsn },
    /// Copy-stream operation.  `lsn` is the upper-bound LSN for prologue
    /// items, the page-max LSN for pages, and the file offset for chunks.
    Copy {
        kind: CopyOperationKind,
        copy_type: CopyType,
        lsn: Lsn,
    },
}

impl OperationMetadata {
    pub fn lsn(&self) -> Lsn {
        match self {
            Self::Replication { lsn } => *lsn,
            Self::Copy { lsn, .. } => *lsn,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            Self::Replication { lsn } => {
                buf.put_u8(0);
                buf.put_i64_le(*lsn);
            }
            Self::Copy {
                kind,
                copy_type,
                lsn,
            } => {
                buf.put_u8(*kind as u8);
                buf.put_u8(*copy_type as u8);
                buf.put_i64_le(*lsn);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> StoreResult<Self> {
        if buf.remaining() < 1 {
            return Err(StoreError::Serialization("empty metadata buffer".into()));
        }
        let tag = buf.get_u8();
        if tag == 0 {
            if buf.remaining() < 8 {
                return Err(StoreError::Serialization("short replication metadata".into()));
            }
            return Ok(Self::Replication {
                lsn: buf.get_i64_le(),
            });
        }
        let kind = CopyOperationKind::from_u8(tag)?;
        if buf.remaining() < 9 {
            return Err(StoreError::Serialization("short copy metadata".into()));
        }
        let copy_type = CopyType::from_u8(buf.get_u8())?;
        let lsn = buf.get_i64_le();
        Ok(Self::Copy {
            kind,
            copy_type,
            lsn,
        })
    }
}

/// One mutating record travelling inside a replication or paged-copy data
/// buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationOperation {
    pub kind: ReplicationOpKind,
    pub row_type: String,
    pub key: String,
    /// Rename target; only meaningful for updates, `key` when unchanged.
    pub new_key: Option<String>,
    pub value: Option<Vec<u8>>,
    pub lsn: Lsn,
    pub modified_on_primary: UtcTicks,
}

impl ReplicationOperation {
    pub fn insert(
        row_type: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
        modified_on_primary: UtcTicks,
    ) -> Self {
        Self {
            kind: ReplicationOpKind::Insert,
            row_type: row_type.into(),
            key: key.into(),
            new_key: None,
            value: Some(value),
            lsn: 0,
            modified_on_primary,
        }
    }

    pub fn update(
        row_type: impl Into<String>,
        key: impl Into<String>,
        new_key: Option<String>,
        value: Vec<u8>,
        modified_on_primary: UtcTicks,
    ) -> Self {
        Self {
            kind: ReplicationOpKind::Update,
            row_type: row_type.into(),
            key: key.into(),
            new_key,
            value: Some(value),
            lsn: 0,
            modified_on_primary,
        }
    }

    pub fn delete(row_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: ReplicationOpKind::Delete,
            row_type: row_type.into(),
            key: key.into(),
            new_key: None,
            value: None,
            lsn: 0,
            modified_on_primary: 0,
        }
    }

    /// Effective key after the operation (rename-aware).
    pub fn effective_key(&self) -> &str {
        self.new_key.as_deref().unwrap_or(&self.key)
    }

    /// Approximate wire size, used for batching limits.
    pub fn size(&self) -> usize {
        1 + 8
            + 8
            + 2 * (self.row_type.len() + self.key.len())
            + self.new_key.as_ref().map_or(0, |k| 2 * k.len())
            + self.value.as_ref().map_or(0, |v| v.len())
            + 12
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        put_lenstr(buf, &self.row_type);
        put_lenstr(buf, &self.key);
        if self.kind.carries_value() {
            let v = self.value.as_deref().unwrap_or(&[]);
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
        buf.put_i64_le(self.lsn);
        buf.put_i64_le(self.modified_on_primary);
        if self.kind.carries_new_key() {
            put_lenstr(buf, self.new_key.as_deref().unwrap_or(&self.key));
        }
    }

    fn decode_from(buf: &mut &[u8]) -> StoreResult<Self> {
        if buf.remaining() < 1 {
            return Err(StoreError::Serialization("truncated record".into()));
        }
        let kind = ReplicationOpKind::from_u8(buf.get_u8())?;
        let row_type = get_lenstr(buf)?;
        let key = get_lenstr(buf)?;
        let value = if kind.carries_value() {
            Some(get_lenbytes(buf)?)
        } else {
            None
        };
        if buf.remaining() < 16 {
            return Err(StoreError::Serialization("truncated record tail".into()));
        }
        let lsn = buf.get_i64_le();
        let modified_on_primary = buf.get_i64_le();
        let new_key = if kind.carries_new_key() {
            Some(get_lenstr(buf)?)
        } else {
            None
        };
        Ok(Self {
            kind,
            row_type,
            key,
            new_key,
            value,
            lsn,
            modified_on_primary,
        })
    }
}

/// Encodes a batch of records as one data buffer.
pub fn encode_operations(ops: &[ReplicationOperation]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ops.iter().map(|o| o.size()).sum::<usize>() + 16);
    for op in ops {
        op.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Decodes a full data buffer back into records.
pub fn decode_operations(mut buf: &[u8]) -> StoreResult<Vec<ReplicationOperation>> {
    let mut ops = Vec::new();
    while buf.has_remaining() {
        ops.push(ReplicationOperation::decode_from(&mut buf)?);
    }
    Ok(ops)
}

/// One chunk of a file-stream physical copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStreamChunk {
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
    pub data: Vec<u8>,
}

impl FileStreamChunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 5);
        let mut flags = 0u8;
        if self.is_first_chunk {
            flags |= 0x1;
        }
        if self.is_last_chunk {
            flags |= 0x2;
        }
        buf.put_u8(flags);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> StoreResult<Self> {
        if buf.remaining() < 5 {
            return Err(StoreError::Serialization("truncated file stream chunk".into()));
        }
        let flags = buf.get_u8();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(StoreError::Serialization("short file stream chunk".into()));
        }
        Ok(Self {
            is_first_chunk: flags & 0x1 != 0,
            is_last_chunk: flags & 0x2 != 0,
            data: buf[..len].to_vec(),
        })
    }
}

fn put_lenstr(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_u32_le(units.len() as u32);
    for u in units {
        buf.put_u16_le(u);
    }
}

fn get_lenstr(buf: &mut &[u8]) -> StoreResult<String> {
    if buf.remaining() < 4 {
        return Err(StoreError::Serialization("truncated string length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len * 2 {
        return Err(StoreError::Serialization("truncated string body".into()));
    }
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(buf.get_u16_le());
    }
    String::from_utf16(&units)
        .map_err(|e| StoreError::Serialization(format!("invalid utf16: {e}")))
}

fn get_lenbytes(buf: &mut &[u8]) -> StoreResult<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(StoreError::Serialization("truncated blob length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StoreError::Serialization("truncated blob body".into()));
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let m = OperationMetadata::Replication { lsn: 42 };
        assert_eq!(OperationMetadata::decode(&m.encode()).unwrap(), m);

        let c = OperationMetadata::Copy {
            kind: CopyOperationKind::Page,
            copy_type: CopyType::PagedCopy,
            lsn: 17,
        };
        assert_eq!(OperationMetadata::decode(&c.encode()).unwrap(), c);
    }

    #[test]
    fn record_batch_round_trip() {
        let mut ins = ReplicationOperation::insert("T", "k1", vec![1, 2, 3], 77);
        ins.lsn = 5;
        let mut upd =
            ReplicationOperation::update("T", "k1", Some("k2".into()), vec![9], 78);
        upd.lsn = 6;
        let mut del = ReplicationOperation::delete("T", "k2");
        del.lsn = 7;

        let ops = vec![ins, upd, del];
        let encoded = encode_operations(&ops);
        let decoded = decode_operations(&encoded).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn non_ascii_keys_survive() {
        let mut op = ReplicationOperation::insert("τύπος", "ключ🔑", vec![0xff], 1);
        op.lsn = 1;
        let decoded = decode_operations(&encode_operations(&[op.clone()])).unwrap();
        assert_eq!(decoded[0], op);
    }

    #[test]
    fn rejects_unknown_kind() {
        let buf = [200u8, 0, 0, 0, 0];
        assert!(decode_operations(&buf).is_err());
    }

    #[test]
    fn chunk_flags() {
        let chunk = FileStreamChunk {
            is_first_chunk: true,
            is_last_chunk: false,
            data: vec![1, 2, 3, 4],
        };
        let decoded = FileStreamChunk::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }
}
