use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use impedit_core::{ExportSource, ExportTable, Image, LookupError};
use tempfile::NamedTempFile;

/// `<dir>/<stem>_modified.<ext>` next to the target.
pub fn default_save_path(target: &Path) -> PathBuf {
    let mut name = target.file_stem().unwrap_or_default().to_os_string();
    name.push("_modified");
    if let Some(ext) = target.extension() {
        name.push(".");
        name.push(ext);
    }
    target.with_file_name(name)
}

/// Directory a path lives in, with `.` standing in for a bare file name.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// An existing file that cannot be opened for reading and appending is
/// treated as held by another process.
pub fn is_locked(path: &Path) -> bool {
    path.exists() && OpenOptions::new().read(true).append(true).open(path).is_err()
}

/// Write `bytes` to a temporary file beside `path` and rename it into
/// place, so a failed write never leaves a half-written output.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = parent_dir(path);
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Reads candidate DLLs from disk for export validation.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsExportSource;

impl ExportSource for FsExportSource {
    fn exports(&self, module_path: &str) -> Result<ExportTable, LookupError> {
        let not_found = |reason: String| LookupError::ModuleNotFound {
            module: module_path.to_string(),
            reason,
        };
        let data = fs::read(module_path).map_err(|err| not_found(err.to_string()))?;
        let image = Image::parse(data).map_err(|err| not_found(format!("not a valid PE file: {err}")))?;
        tracing::debug!(module = module_path, exports = image.list_exports().count(), "loaded export table");
        Ok(image.exports().cloned().unwrap_or_default())
    }
}
