//! Zip packing and unpacking of database directories.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use replikv_primitives::errors::{StoreError, StoreResult};

/// Packs the files directly under `src_dir` into a zip archive at
/// `archive_path`.  Database directories are flat; subdirectories are not
/// descended.
pub fn create_archive(src_dir: &Path, archive_path: &Path) -> StoreResult<u64> {
    let file = File::create(archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries: Vec<_> = fs::read_dir(src_dir)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|e| e.path().is_file())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        writer
            .start_file(name.as_ref(), options)
            .map_err(|e| StoreError::Io(format!("zip start {name}: {e}")))?;
        let mut src = File::open(entry.path())?;
        io::copy(&mut src, &mut writer)?;
    }

    writer
        .finish()
        .map_err(|e| StoreError::Io(format!("zip finish: {e}")))?
        .flush()?;

    let size = fs::metadata(archive_path)?.len();
    debug!(archive = %archive_path.display(), size, "archive created");
    Ok(size)
}

/// Unpacks an archive into `dest_dir`, creating it if needed.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dest_dir)?;
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| StoreError::Io(format!("zip open: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| StoreError::Io(format!("zip entry {i}: {e}")))?;
        let Some(name) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(StoreError::Io(format!(
                "archive entry {i} has an unsafe path"
            )));
        };
        let dest = dest_dir.join(name);
        let mut out = File::create(&dest)?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        out.write_all(&buf)?;
    }
    Ok(())
}
