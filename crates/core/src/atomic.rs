use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Serialize `value` as pretty JSON and write it to `path` atomically: the
/// bytes land in a temp file in the same directory, then a rename replaces
/// `path` in one filesystem operation.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let dir = path.parent().ok_or_else(|| Error::storage_io(path, std::io::Error::other("path has no parent")))?;
    std::fs::create_dir_all(dir).map_err(|e| Error::storage_io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::storage_io(dir, e))?;
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::serialization("json", path, e))?;
    tmp.write_all(&bytes).map_err(|e| Error::storage_io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::storage_io(path, e))?;
    tmp.persist(path).map_err(|e| Error::storage_io(path, e.error))?;
    Ok(())
}

/// Read and parse a JSON sidecar, returning `None` if it does not exist yet.
pub fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| Error::serialization("json", path, e))?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::storage_io(path, e)),
    }
}
