use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::error::{Error, Result};
use crate::files::{FileEntry, FileStore, UploadOptions};
use crate::logs::{LogRecord, LogStore};
use crate::params::ParamStore;
use crate::path_resolver::PathResolver;
use crate::remote::RemoteBackend;
use crate::track::{
    self, AppendedBatch, BatchResult, DataPoint, ReadResult, TimeReadResult, TimestampAssigner, TrackEngine,
    TrackMetadata,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Local,
    Remote,
    Hybrid,
}

impl Mode {
    fn uses_local(self) -> bool {
        matches!(self, Mode::Local | Mode::Hybrid)
    }
    fn uses_remote(self) -> bool {
        matches!(self, Mode::Remote | Mode::Hybrid)
    }
}

#[derive(Default)]
pub struct SessionConfig {
    pub prefix: String,
    pub root: Option<PathBuf>,
    pub url: Option<String>,
    pub readme: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub write_protected: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct SessionDoc {
    name: String,
    workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    readme: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "updatedAt")]
    updated_at: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// Lifecycle, concurrency guards, and dispatch to the local on-disk backend
/// and/or a remote HTTP backend. Owns the per-track buffers via
/// [`TrackEngine`].
pub struct Session {
    mode: Mode,
    write_protected: bool,
    open: std::sync::atomic::AtomicBool,
    resolver: Option<PathResolver>,
    remote: Option<RemoteBackend>,
    params: Option<ParamStore>,
    logs: Option<LogStore>,
    files: Option<FileStore>,
    tracks: Option<TrackEngine>,
    /// Stamps points before sending them straight to `remote` in pure-remote
    /// mode, where there is no `TrackEngine` buffer to own timestamp state.
    remote_track_ts: Option<parking_lot::Mutex<TimestampAssigner>>,
}

impl Session {
    pub fn open(config: SessionConfig) -> Result<Self> {
        let mode = match (config.root.is_some(), config.url.is_some()) {
            (_, false) => Mode::Local,
            (false, true) => Mode::Remote,
            (true, true) => Mode::Hybrid,
        };

        let remote = if mode.uses_remote() {
            let api_key = std::env::var("DREAMLAKE_API_KEY").map_err(|_| Error::MissingCredentials)?;
            Some(RemoteBackend::new(config.url.clone().expect("remote mode implies url"), api_key)?)
        } else {
            None
        };

        let (resolver, params, logs, files, tracks) = if mode.uses_local() {
            let resolver = PathResolver::new(&config.prefix, config.root.as_deref())?;
            std::fs::create_dir_all(resolver.session_dir()).map_err(|e| Error::storage_io(resolver.session_dir(), e))?;

            let params = ParamStore::new(resolver.parameters_json(), resolver.parameters_lock());
            let logs = LogStore::new(resolver.logs_jsonl(), resolver.logs_lock());
            let files = FileStore::new(resolver.files_dir(), resolver.files_metadata_json(), resolver.files_metadata_lock());
            let tracks = TrackEngine::new(resolver.clone());

            write_session_doc(&resolver, &config)?;

            (Some(resolver), Some(params), Some(logs), Some(files), Some(tracks))
        } else {
            (None, None, None, None, None)
        };

        if let Some(remote) = &remote {
            remote.create_or_update_session(&config.prefix, config.readme.as_deref(), &config.tags, &config.metadata, config.write_protected)?;
        }

        let remote_track_ts =
            if tracks.is_none() && remote.is_some() { Some(parking_lot::Mutex::new(TimestampAssigner::default())) } else { None };

        Ok(Self {
            mode,
            write_protected: config.write_protected,
            open: std::sync::atomic::AtomicBool::new(true),
            resolver,
            remote,
            params,
            logs,
            files,
            tracks,
            remote_track_ts,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn require_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    pub fn set_params(&self, tree: Value) -> Result<()> {
        self.require_open()?;
        if let Some(params) = &self.params {
            params.set(tree.clone())?;
        }
        if let Some(remote) = &self.remote {
            remote.params_set(&tree)?;
        }
        Ok(())
    }

    pub fn get_params(&self, flatten: bool) -> Result<Option<Value>> {
        self.require_open()?;
        if let Some(params) = &self.params {
            return params.get(flatten);
        }
        if let Some(remote) = &self.remote {
            return remote.params_get();
        }
        Ok(None)
    }

    /// Append a record to the log. In remote-only mode, sequencing is owned
    /// by the remote peer and the returned record carries sequence number 0.
    pub fn log(&self, message: &str, level: &str, metadata: Option<Value>) -> Result<LogRecord> {
        self.require_open()?;
        if !crate::logs::LEVELS.contains(&level) {
            return Err(Error::InvalidLevel(level.to_string()));
        }
        let record = if let Some(logs) = &self.logs {
            logs.log(message, level, metadata.clone(), None)?
        } else {
            LogRecord {
                sequence_number: 0,
                timestamp: Utc::now().to_rfc3339(),
                level: level.to_string(),
                message: message.to_string(),
                metadata: metadata.clone(),
            }
        };
        if let Some(remote) = &self.remote {
            remote.logs_append(message, level, metadata.as_ref())?;
        }
        Ok(record)
    }

    pub fn upload_file(&self, local_path: &Path, path_prefix: &str, opts: UploadOptions) -> Result<FileEntry> {
        self.require_open()?;
        if let Some(files) = &self.files {
            let entry = files.upload(local_path, path_prefix, opts)?;
            if let Some(remote) = &self.remote {
                let hint = entry_to_hint(&entry)?;
                remote.files_upload(path_prefix, &hint)?;
            }
            return Ok(entry);
        }
        if let Some(remote) = &self.remote {
            let (entry, _bytes) = crate::files::describe(local_path, path_prefix, opts)?;
            let hint = entry_to_hint(&entry)?;
            return remote.files_upload(path_prefix, &hint);
        }
        Err(Error::NotOpen)
    }

    pub fn list_files(&self, path: Option<&str>, tags: Option<&[String]>) -> Result<Vec<FileEntry>> {
        self.require_open()?;
        if let Some(files) = &self.files {
            return files.list(path, tags);
        }
        if let Some(remote) = &self.remote {
            return remote.files_list(path, tags);
        }
        Ok(Vec::new())
    }

    pub fn append(&self, track: &str, fields: serde_json::Map<String, Value>) -> Result<()> {
        self.require_open()?;
        if let Some(tracks) = &self.tracks {
            tracks.append(track, fields)?;
            return Ok(());
        }
        if let Some(remote) = &self.remote {
            let stamped = self.stamp_for_remote(fields)?;
            remote.track_append_batch(track, &[Value::Object(stamped)])?;
        }
        Ok(())
    }

    pub fn append_batch(&self, track: &str, rows: Vec<serde_json::Map<String, Value>>) -> Result<BatchResult> {
        self.require_open()?;
        if let Some(tracks) = &self.tracks {
            let AppendedBatch { result, points } = tracks.append_batch(track, rows)?;
            if let Some(remote) = &self.remote {
                if !points.is_empty() {
                    let values = points_to_values(&points);
                    remote.track_append_batch(track, &values)?;
                }
            }
            return Ok(result);
        }
        if let Some(remote) = &self.remote {
            let mut stamped = Vec::with_capacity(rows.len());
            for fields in rows {
                stamped.push(self.stamp_for_remote(fields)?);
            }
            let values: Vec<Value> = stamped.into_iter().map(Value::Object).collect();
            return remote.track_append_batch(track, &values);
        }
        Err(Error::NotOpen)
    }

    fn stamp_for_remote(&self, fields: serde_json::Map<String, Value>) -> Result<serde_json::Map<String, Value>> {
        let assigner = self.remote_track_ts.as_ref().ok_or(Error::NotOpen)?;
        let mut assigner = assigner.lock();
        track::stamp(&mut assigner, fields)
    }

    pub fn flush_track(&self, track: &str) -> Result<u64> {
        if let Some(tracks) = &self.tracks {
            let track::FlushedBatch { count, points } = tracks.flush(track)?;
            if let Some(remote) = &self.remote {
                if !points.is_empty() {
                    let values = points_to_values(&points);
                    remote.track_append_batch(track, &values)?;
                }
            }
            return Ok(count);
        }
        Ok(0)
    }

    pub fn flush_all_tracks(&self) -> Result<()> {
        if let Some(tracks) = &self.tracks {
            for name in tracks.buffered_names() {
                self.flush_track(&name)?;
            }
        }
        Ok(())
    }

    pub fn read_track(&self, track: &str, start_index: u64, limit: u64) -> Result<ReadResult> {
        self.require_open()?;
        if let Some(tracks) = &self.tracks {
            return tracks.read(track, start_index, limit);
        }
        if let Some(remote) = &self.remote {
            let raw = remote.track_read(track, start_index, limit)?;
            return parse_remote_read_result(raw, start_index);
        }
        Err(Error::NotOpen)
    }

    pub fn read_track_by_time(
        &self,
        track: &str,
        start_time: Option<f64>,
        end_time: Option<f64>,
        limit: u64,
        reverse: bool,
    ) -> Result<TimeReadResult> {
        self.require_open()?;
        self.tracks.as_ref().ok_or(Error::NotOpen)?.read_by_time(track, start_time, end_time, limit, reverse)
    }

    pub fn track_stats(&self, track: &str) -> Result<TrackMetadata> {
        self.require_open()?;
        self.tracks.as_ref().ok_or(Error::NotOpen)?.stats(track)
    }

    pub fn list_tracks(&self) -> Result<Vec<TrackMetadata>> {
        self.require_open()?;
        match &self.tracks {
            Some(tracks) => tracks.list_all(),
            None => Ok(Vec::new()),
        }
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected
    }

    /// Flush all track buffers and release storage handles. Idempotent;
    /// buffered data that fails to flush is logged (if a `LogStore` is
    /// available) and dropped rather than raised, per the best-effort close
    /// contract.
    pub fn close(&self) {
        if !self.open.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.flush_all_tracks() {
            if let Some(logs) = &self.logs {
                let _ = logs.log(&format!("failed to flush tracks on close: {e}"), "error", None, None);
            } else {
                tracing::warn!(error = %e, "failed to flush tracks on close");
            }
        }
    }
}

fn points_to_values(points: &[std::collections::BTreeMap<String, Value>]) -> Vec<Value> {
    points.iter().map(|p| Value::Object(p.clone().into_iter().collect())).collect()
}

fn entry_to_hint(entry: &FileEntry) -> Result<Value> {
    serde_json::to_value(entry).map_err(|e| Error::serialization("file entry", "<in-memory>", e))
}

/// Decode a remote `track_read` response into the same shape `TrackEngine::read`
/// produces locally. The wire format mirrors `ReadResult`/`DataPoint` field
/// names; each row carries its own `_created_at`, which is split out the same
/// way the local decoder splits it off of a decoded [`crate::track::Sample`].
fn parse_remote_read_result(raw: Value, start_index: u64) -> Result<ReadResult> {
    let total = raw.get("total").and_then(Value::as_u64).unwrap_or(0);
    let has_more = raw.get("hasMore").and_then(Value::as_bool).unwrap_or(false);
    let end_index = raw.get("endIndex").and_then(Value::as_u64).unwrap_or(start_index);
    let items = raw.get("data").and_then(Value::as_array).cloned().unwrap_or_default();

    let data = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut obj = item.as_object().cloned().unwrap_or_default();
            let created_at =
                obj.remove(track::CREATED_AT_KEY).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
            DataPoint { index: start_index + i as u64, data: obj.into_iter().collect(), created_at }
        })
        .collect();

    Ok(ReadResult { data, start_index, end_index, total, has_more })
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a session, run `f` against it, and close it regardless of whether
/// `f` succeeds. A thin convenience, not a concurrency primitive: it is
/// trivially `open` then `f` then `close`.
pub fn with_session<F, R>(config: SessionConfig, f: F) -> Result<R>
where
    F: FnOnce(&Session) -> Result<R>,
{
    let session = Session::open(config)?;
    let result = f(&session);
    session.close();
    result
}

fn write_session_doc(resolver: &PathResolver, config: &SessionConfig) -> Result<()> {
    let path = resolver.session_json();
    let now = Utc::now().to_rfc3339();

    let mut doc = match read_json_opt::<SessionDoc>(&path)? {
        Some(mut existing) => {
            existing.updated_at = now;
            if config.readme.is_some() {
                existing.readme = config.readme.clone();
            }
            if !config.tags.is_empty() {
                existing.tags = config.tags.clone();
            }
            for (k, v) in &config.metadata {
                existing.metadata.insert(k.clone(), v.clone());
            }
            existing
        }
        None => SessionDoc {
            name: resolver.name().to_string(),
            workspace: resolver.workspace().to_string(),
            readme: config.readme.clone(),
            tags: config.tags.clone(),
            metadata: config.metadata.clone(),
            created_at: now.clone(),
            updated_at: now,
            extra: serde_json::Map::new(),
        },
    };
    doc.name = resolver.name().to_string();
    doc.workspace = resolver.workspace().to_string();

    write_json_atomic(&path, &doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(dir: &Path, prefix: &str) -> SessionConfig {
        SessionConfig { prefix: prefix.to_string(), root: Some(dir.to_path_buf()), ..Default::default() }
    }

    #[test]
    fn open_creates_session_json() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(config(dir.path(), "ws/run1")).unwrap();
        assert!(session.is_open());
        assert_eq!(session.mode(), Mode::Local);
        assert!(dir.path().join("ws/run1/session.json").exists());
    }

    #[test]
    fn reopen_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws/run1/session.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"name":"run1","workspace":"ws","tags":[],"metadata":{},"createdAt":"x","updatedAt":"x","custom_field":42}"#).unwrap();

        let _session = Session::open(config(dir.path(), "ws/run1")).unwrap();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["custom_field"], json!(42));
    }

    #[test]
    fn operations_before_open_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(config(dir.path(), "ws/run1")).unwrap();
        session.close();
        let err = session.append("t", serde_json::Map::new());
        assert!(matches!(err, Err(Error::NotOpen)));
    }

    #[test]
    fn close_flushes_pending_track_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(config(dir.path(), "ws/run1")).unwrap();
        session.append("loss", json!({"v": 1}).as_object().unwrap().clone()).unwrap();
        session.close();

        let reopened = Session::open(config(dir.path(), "ws/run1")).unwrap();
        let stats = reopened.track_stats("loss").unwrap();
        assert_eq!(stats.total_data_points, 1);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(config(dir.path(), "ws/run1")).unwrap();
        session.close();
        session.close();
    }

    #[test]
    fn remote_mode_without_api_key_fails() {
        std::env::remove_var("DREAMLAKE_API_KEY");
        let cfg = SessionConfig { prefix: "ws/run1".into(), url: Some("https://example.com".into()), ..Default::default() };
        let err = Session::open(cfg);
        assert!(matches!(err, Err(Error::MissingCredentials)));
    }
}
