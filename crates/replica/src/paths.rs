//! On-disk layout of one replica.
//!
//! ```text
//! <root>/
//!   P_<partition>/
//!     R_<replica>/      main database directory
//!     R_<replica>F/     full-copy staging
//!     R_<replica>P/     partial-copy staging (+ completion marker)
//!     R_<replica>D/     drop backup (last database before role None)
//!     BF/               file-stream full-copy archive cache
//! ```

use std::path::{Path, PathBuf};

use replikv_primitives::ids::PartitionedReplicaId;

pub const PARTIAL_COPY_COMPLETION_MARKER: &str = "_completion_marker";
/// Marker contents: a single zero byte.
pub const COMPLETION_MARKER_BYTES: &[u8] = &[0u8];

#[derive(Clone, Debug)]
pub struct ReplicaPaths {
    partition_root: PathBuf,
    prid: PartitionedReplicaId,
}

impl ReplicaPaths {
    pub fn new(root: &Path, prid: PartitionedReplicaId) -> Self {
        Self {
            partition_root: root.join(prid.partition_dir()),
            prid,
        }
    }

    pub fn partition_root(&self) -> &Path {
        &self.partition_root
    }

    pub fn database_dir(&self) -> PathBuf {
        self.partition_root.join(self.prid.replica_dir(""))
    }

    pub fn full_copy_dir(&self) -> PathBuf {
        self.partition_root.join(self.prid.replica_dir("F"))
    }

    pub fn partial_copy_dir(&self) -> PathBuf {
        self.partition_root.join(self.prid.replica_dir("P"))
    }

    pub fn drop_backup_dir(&self) -> PathBuf {
        self.partition_root.join(self.prid.replica_dir("D"))
    }

    pub fn archive_cache_dir(&self) -> PathBuf {
        self.partition_root.join("BF")
    }

    pub fn partial_copy_marker(&self) -> PathBuf {
        self.partial_copy_dir().join(PARTIAL_COPY_COMPLETION_MARKER)
    }

    /// Staged archive file for an incoming file-stream full copy.
    pub fn file_stream_staging_file(&self) -> PathBuf {
        self.partition_root
            .join(format!("{}.zstage", self.prid.replica_dir("F")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_names() {
        let paths = ReplicaPaths::new(
            Path::new("/data"),
            PartitionedReplicaId::new("abc", 42),
        );
        assert_eq!(paths.database_dir(), Path::new("/data/P_abc/R_42"));
        assert_eq!(paths.full_copy_dir(), Path::new("/data/P_abc/R_42F"));
        assert_eq!(paths.partial_copy_dir(), Path::new("/data/P_abc/R_42P"));
        assert_eq!(paths.drop_backup_dir(), Path::new("/data/P_abc/R_42D"));
        assert_eq!(paths.archive_cache_dir(), Path::new("/data/P_abc/BF"));
    }
}
