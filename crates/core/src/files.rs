use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::error::{Error, Result};
use crate::lock::{FileLock, DEFAULT_TIMEOUT};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub id: String,
    pub filename: String,
    pub path: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub checksum: String,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: String,
    #[serde(rename = "deletedAt", skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct Sidecar {
    files: Vec<FileEntry>,
}

#[derive(Default)]
pub struct UploadOptions {
    pub filename: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub content_type: Option<String>,
}

/// Read and hash `local_path`, returning the [`FileEntry`] it describes
/// alongside its bytes. Pure: touches no session storage, so it also backs
/// the remote-only upload path, which never writes a local blob or sidecar.
pub(crate) fn describe(local_path: &Path, path_prefix: &str, opts: UploadOptions) -> Result<(FileEntry, Vec<u8>)> {
    let mut source = std::fs::File::open(local_path).map_err(|e| Error::storage_io(local_path, e))?;
    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes).map_err(|e| Error::storage_io(local_path, e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let checksum = hex::encode(hasher.finalize());
    let size_bytes = bytes.len() as u64;

    let filename = opts
        .filename
        .or_else(|| local_path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| Error::storage_io(local_path, std::io::Error::other("source has no filename")))?;

    let entry = FileEntry {
        id: Ulid::new().to_string(),
        filename,
        path: path_prefix.to_string(),
        size_bytes,
        checksum,
        content_type: opts.content_type,
        description: opts.description,
        tags: opts.tags,
        metadata: opts.metadata,
        uploaded_at: Utc::now().to_rfc3339(),
        deleted_at: None,
    };

    Ok((entry, bytes))
}

/// Content-addressed file attachments with checksum, size, tags,
/// description, soft-delete, and a locked JSON sidecar listing every file.
pub struct FileStore {
    files_dir: PathBuf,
    sidecar_path: PathBuf,
    lock: FileLock,
}

impl FileStore {
    pub fn new(files_dir: PathBuf, sidecar_path: PathBuf, lock_path: PathBuf) -> Self {
        Self { files_dir, sidecar_path, lock: FileLock::new(lock_path) }
    }

    pub fn upload(&self, local_path: &Path, path_prefix: &str, opts: UploadOptions) -> Result<FileEntry> {
        let (entry, bytes) = describe(local_path, path_prefix, opts)?;

        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;

        let blob_dir = self.files_dir.join(&entry.id);
        std::fs::create_dir_all(&blob_dir).map_err(|e| Error::storage_io(&blob_dir, e))?;
        let blob_path = blob_dir.join(&entry.filename);
        // Abort without touching the sidecar on any I/O failure past this point.
        if let Err(e) = std::fs::write(&blob_path, &bytes) {
            return Err(Error::storage_io(&blob_path, e));
        }

        let mut sidecar: Sidecar = read_json_opt(&self.sidecar_path)?.unwrap_or_default();
        sidecar.files.push(entry.clone());
        write_json_atomic(&self.sidecar_path, &sidecar)?;

        Ok(entry)
    }

    pub fn list(&self, path: Option<&str>, tags: Option<&[String]>) -> Result<Vec<FileEntry>> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let sidecar: Sidecar = read_json_opt(&self.sidecar_path)?.unwrap_or_default();

        Ok(sidecar
            .files
            .into_iter()
            .filter(|f| f.deleted_at.is_none())
            .filter(|f| path.map(|p| f.path == p).unwrap_or(true))
            .filter(|f| tags.map(|ts| ts.iter().all(|t| f.tags.contains(t))).unwrap_or(true))
            .collect())
    }

    pub fn download(&self, id: &str, dest: Option<&Path>) -> Result<PathBuf> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let sidecar: Sidecar = read_json_opt(&self.sidecar_path)?.unwrap_or_default();
        let entry = sidecar
            .files
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::NotFound(format!("file `{id}`")))?;

        let blob = self.files_dir.join(&entry.id).join(&entry.filename);
        let dest = dest.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(&entry.filename));
        std::fs::copy(&blob, &dest).map_err(|e| Error::storage_io(&blob, e))?;
        Ok(dest)
    }

    pub fn update(
        &self,
        id: &str,
        description: Option<String>,
        tags: Option<Vec<String>>,
        metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<FileEntry> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let mut sidecar: Sidecar = read_json_opt(&self.sidecar_path)?.unwrap_or_default();
        let entry = sidecar
            .files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::NotFound(format!("file `{id}`")))?;

        if let Some(d) = description {
            entry.description = Some(d);
        }
        if let Some(t) = tags {
            entry.tags = t;
        }
        if let Some(m) = metadata {
            entry.metadata = m;
        }
        let updated = entry.clone();
        write_json_atomic(&self.sidecar_path, &sidecar)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let mut sidecar: Sidecar = read_json_opt(&self.sidecar_path)?.unwrap_or_default();
        let entry = sidecar
            .files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::NotFound(format!("file `{id}`")))?;
        entry.deleted_at = Some(Utc::now().to_rfc3339());
        write_json_atomic(&self.sidecar_path, &sidecar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(
            dir.path().join("files"),
            dir.path().join("files/.files_metadata.json"),
            dir.path().join("files/.files_metadata.lock"),
        );
        (dir, store)
    }

    fn write_source(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn upload_then_list_shows_checksum_and_size() {
        let (dir, store) = store();
        let src = write_source(dir.path(), "weights.bin", b"hello world");
        let entry = store.upload(&src, "/test", UploadOptions::default()).unwrap();

        assert_eq!(entry.size_bytes, 11);
        assert_eq!(entry.checksum, hex::encode(Sha256::digest(b"hello world")));

        let listed = store.list(None, None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);
    }

    #[test]
    fn soft_deleted_entries_are_hidden_from_list() {
        let (dir, store) = store();
        let src = write_source(dir.path(), "a.bin", b"x");
        let entry = store.upload(&src, "/p", UploadOptions::default()).unwrap();
        store.delete(&entry.id).unwrap();
        assert!(store.list(None, None).unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_path_and_tags() {
        let (dir, store) = store();
        let src1 = write_source(dir.path(), "a.bin", b"1");
        let src2 = write_source(dir.path(), "b.bin", b"2");
        store
            .upload(
                &src1,
                "/p1",
                UploadOptions { tags: vec!["epoch1".into()], ..Default::default() },
            )
            .unwrap();
        store
            .upload(
                &src2,
                "/p2",
                UploadOptions { tags: vec!["epoch2".into()], ..Default::default() },
            )
            .unwrap();

        assert_eq!(store.list(Some("/p1"), None).unwrap().len(), 1);
        assert_eq!(store.list(None, Some(&["epoch2".to_string()])).unwrap().len(), 1);
    }

    #[test]
    fn same_filename_allowed_at_different_prefixes() {
        let (dir, store) = store();
        let src = write_source(dir.path(), "model.bin", b"z");
        store.upload(&src, "/a", UploadOptions::default()).unwrap();
        store.upload(&src, "/b", UploadOptions::default()).unwrap();
        assert_eq!(store.list(None, None).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_uploads_produce_distinct_ids_and_valid_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileStore::new(
            dir.path().join("files"),
            dir.path().join("files/.files_metadata.json"),
            dir.path().join("files/.files_metadata.lock"),
        ));

        std::thread::scope(|s| {
            for i in 0..20 {
                let store = store.clone();
                let dir_path = dir.path().to_path_buf();
                s.spawn(move || {
                    let src = write_source(&dir_path, &format!("f{i}.bin"), format!("data-{i}").as_bytes());
                    store.upload(&src, "/test", UploadOptions::default()).unwrap();
                });
            }
        });

        let listed = store.list(None, None).unwrap();
        assert_eq!(listed.len(), 20);
        let mut ids: Vec<&str> = listed.iter().map(|f| f.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }
}
