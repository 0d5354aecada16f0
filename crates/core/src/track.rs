use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::codec::{self, Sample};
use crate::error::{Error, Result};
use crate::lock::{FileLock, DEFAULT_TIMEOUT};
use crate::path_resolver::PathResolver;

pub(crate) const CREATED_AT_KEY: &str = "_created_at";
pub(crate) const TS_KEY: &str = "_ts";
/// Smallest amount by which an auto-assigned timestamp is nudged forward to
/// stay strictly after the previous auto-assigned one.
const AUTO_TS_EPSILON: f64 = 1e-6;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrackMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(rename = "totalDataPoints")]
    pub total_data_points: u64,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(rename = "firstDataAt", skip_serializing_if = "Option::is_none")]
    pub first_data_at: Option<String>,
    #[serde(rename = "lastDataAt", skip_serializing_if = "Option::is_none")]
    pub last_data_at: Option<String>,
}

impl TrackMetadata {
    fn new(name: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            name: name.to_string(),
            description: None,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
            total_data_points: 0,
            created_at: now.clone(),
            updated_at: now,
            first_data_at: None,
            last_data_at: None,
        }
    }
}

/// A decoded row ready to read back: index, the sample's fields (including
/// `_ts`), and the wall-clock time it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    pub index: u64,
    pub data: BTreeMap<String, Value>,
    pub created_at: String,
}

pub struct ReadResult {
    pub data: Vec<DataPoint>,
    pub start_index: u64,
    pub end_index: u64,
    pub total: u64,
    pub has_more: bool,
}

pub struct TimeReadResult {
    pub data: Vec<DataPoint>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub has_more: bool,
}

pub struct BatchResult {
    pub start_index: u64,
    pub end_index: u64,
    pub count: u64,
}

/// Result of [`TrackEngine::append_batch`]: the committed range plus the
/// exact stamped rows, so a caller mirroring to a second backend (e.g. a
/// remote peer in hybrid mode) sends identical data rather than re-deriving it.
pub struct AppendedBatch {
    pub result: BatchResult,
    pub points: Vec<BTreeMap<String, Value>>,
}

/// Result of [`TrackEngine::flush`]: the number of rows committed plus the
/// exact stamped, merged rows, for the same mirroring reason as [`AppendedBatch`].
pub struct FlushedBatch {
    pub count: u64,
    pub points: Vec<BTreeMap<String, Value>>,
}

/// Owns the session-wide timestamp policy (§4.7.1): auto-assignment with a
/// monotone ratchet, and `_ts = -1` inheritance of the most recently assigned
/// timestamp. Reusable wherever points need stamping independent of whether
/// they're ultimately written to local disk.
#[derive(Default)]
pub(crate) struct TimestampAssigner {
    last_ts: Option<f64>,
    last_auto_ts: f64,
}

impl TimestampAssigner {
    pub(crate) fn assign(&mut self, requested: Option<&Value>) -> Result<f64> {
        let ts = match requested {
            None => self.next_auto(),
            Some(v) if v.as_f64() == Some(-1.0) => match self.last_ts {
                Some(last) => last,
                None => self.next_auto(),
            },
            Some(v) => v.as_f64().ok_or_else(|| Error::InvalidTimestamp(v.to_string()))?,
        };
        self.last_ts = Some(ts);
        Ok(ts)
    }

    fn next_auto(&mut self) -> f64 {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let ts = now.max(self.last_auto_ts + AUTO_TS_EPSILON);
        self.last_auto_ts = ts;
        ts
    }
}

/// Stamp `fields` with `_ts`/`_created_at` per the timestamp policy, without
/// touching any buffer or disk. Used for mirroring points to a backend that
/// has no local [`TrackEngine`] buffer of its own (pure remote mode).
pub(crate) fn stamp(assigner: &mut TimestampAssigner, mut fields: serde_json::Map<String, Value>) -> Result<serde_json::Map<String, Value>> {
    let ts = assigner.assign(fields.get(TS_KEY))?;
    fields.insert(TS_KEY.to_string(), Value::from(ts));
    fields.insert(CREATED_AT_KEY.to_string(), Value::String(Utc::now().to_rfc3339()));
    Ok(fields)
}

#[derive(Default)]
struct SharedState {
    buffers: HashMap<String, Vec<BTreeMap<String, Value>>>,
    assigner: TimestampAssigner,
}

/// Per-session in-memory buffer keyed by track name; owns timestamp
/// assignment, inheritance, same-timestamp merge, and the append log for
/// every track.
pub struct TrackEngine {
    resolver: PathResolver,
    state: Mutex<SharedState>,
    track_locks: Mutex<HashMap<String, FileLock>>,
}

impl TrackEngine {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver, state: Mutex::new(SharedState::default()), track_locks: Mutex::new(HashMap::new()) }
    }

    fn track_lock(&self, name: &str) -> FileLock {
        let mut locks = self.track_locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| FileLock::new(self.resolver.track_metadata_lock(name)))
            .clone()
    }

    /// Buffer one sample for `name`, assigning its timestamp per the session
    /// timestamp policy. Does not touch disk.
    pub fn append(&self, name: &str, fields: serde_json::Map<String, Value>) -> Result<()> {
        let mut fields: BTreeMap<String, Value> = fields.into_iter().collect();
        let mut state = self.state.lock();
        let ts = state.assigner.assign(fields.get(TS_KEY))?;
        fields.insert(TS_KEY.to_string(), Value::from(ts));
        fields.insert(CREATED_AT_KEY.to_string(), Value::String(Utc::now().to_rfc3339()));
        state.buffers.entry(name.to_string()).or_default().push(fields);
        Ok(())
    }

    /// Names of tracks with buffered, not-yet-flushed data.
    pub fn buffered_names(&self) -> Vec<String> {
        self.state.lock().buffers.keys().cloned().collect()
    }

    /// Apply the timestamp policy to each row in order, bypassing the
    /// buffer entirely. Any samples already buffered for this track are
    /// flushed first, so the `_ts`-monotone invariant holds across the
    /// flushed rows and the fresh batch (see design notes on `append_batch`
    /// ordering).
    pub fn append_batch(&self, name: &str, rows: Vec<serde_json::Map<String, Value>>) -> Result<AppendedBatch> {
        self.flush(name)?;

        let mut stamped = Vec::with_capacity(rows.len());
        {
            let mut state = self.state.lock();
            for fields in rows {
                let fields: BTreeMap<String, Value> = fields.into_iter().collect();
                let ts = state.assigner.assign(fields.get(TS_KEY))?;
                let mut fields = fields;
                fields.insert(TS_KEY.to_string(), Value::from(ts));
                fields.insert(CREATED_AT_KEY.to_string(), Value::String(Utc::now().to_rfc3339()));
                stamped.push(fields);
            }
        }

        if stamped.is_empty() {
            let lock = self.track_lock(name);
            let _guard = lock.acquire(DEFAULT_TIMEOUT)?;
            let meta = self.read_or_init_metadata(name)?;
            return Ok(AppendedBatch {
                result: BatchResult { start_index: meta.total_data_points, end_index: meta.total_data_points, count: 0 },
                points: Vec::new(),
            });
        }

        let lock = self.track_lock(name);
        let _guard = lock.acquire(DEFAULT_TIMEOUT)?;
        let result = self.write_merged(name, stamped.clone())?;
        Ok(AppendedBatch { result, points: stamped })
    }

    /// Flush `name`'s buffer: snapshot and clear it under the session mutex,
    /// then merge-by-timestamp and append under the track's file lock. The
    /// buffer is cleared before the backend write, so a failed write loses
    /// the batch rather than risking duplicate emission on retry.
    pub fn flush(&self, name: &str) -> Result<FlushedBatch> {
        let snapshot = {
            let mut state = self.state.lock();
            state.buffers.remove(name).unwrap_or_default()
        };
        if snapshot.is_empty() {
            return Ok(FlushedBatch { count: 0, points: Vec::new() });
        }

        let lock = self.track_lock(name);
        let _guard = lock.acquire(DEFAULT_TIMEOUT)?;
        let merged = merge_by_timestamp(snapshot);
        let count = merged.len() as u64;
        self.write_merged(name, merged.clone())?;
        Ok(FlushedBatch { count, points: merged })
    }

    pub fn flush_all(&self) -> Result<()> {
        for name in self.buffered_names() {
            self.flush(&name)?;
        }
        Ok(())
    }

    /// Write already-stamped, already-merged rows as one entry, under the
    /// caller-held track lock. Advances `totalDataPoints` and the track's
    /// first/last-data timestamps in the same critical section.
    fn write_merged(&self, name: &str, rows: Vec<BTreeMap<String, Value>>) -> Result<BatchResult> {
        let mut meta = self.read_or_init_metadata(name)?;
        let start_index = meta.total_data_points;

        let data_path = self.resolver.track_data_msgpack(name);
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage_io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| Error::storage_io(&data_path, e))?;

        if rows.len() == 1 {
            codec::encode_row(&mut file, &rows[0])?;
        } else {
            codec::encode_columnar(&mut file, &rows)?;
        }

        let count = rows.len() as u64;
        meta.total_data_points += count;
        meta.updated_at = Utc::now().to_rfc3339();
        if meta.first_data_at.is_none() {
            meta.first_data_at = rows.first().and_then(|r| r.get(CREATED_AT_KEY)).and_then(Value::as_str).map(String::from);
        }
        meta.last_data_at = rows.last().and_then(|r| r.get(CREATED_AT_KEY)).and_then(Value::as_str).map(String::from);

        write_json_atomic(&self.resolver.track_metadata_json(name), &meta)?;

        Ok(BatchResult { start_index, end_index: start_index + count, count })
    }

    fn read_or_init_metadata(&self, name: &str) -> Result<TrackMetadata> {
        let path = self.resolver.track_metadata_json(name);
        Ok(read_json_opt(&path)?.unwrap_or_else(|| TrackMetadata::new(name)))
    }

    fn decode_points(&self, name: &str) -> Result<Vec<DataPoint>> {
        let data_path = self.resolver.track_data_msgpack(name);
        let samples = match std::fs::File::open(&data_path) {
            Ok(mut f) => codec::decode_all(&mut f)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::storage_io(&data_path, e)),
        };

        Ok(samples
            .into_iter()
            .enumerate()
            .map(|(i, Sample { mut data })| {
                let created_at =
                    data.remove(CREATED_AT_KEY).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                DataPoint { index: i as u64, data, created_at }
            })
            .collect())
    }

    /// Flush, then sequentially scan the append log, returning rows in
    /// `[start_index, start_index+limit)`.
    pub fn read(&self, name: &str, start_index: u64, limit: u64) -> Result<ReadResult> {
        self.flush(name)?;
        let all = self.decode_points(name)?;
        let start = start_index.min(all.len() as u64) as usize;
        let end = (start_index + limit).min(all.len() as u64) as usize;
        let slice = all[start..end].to_vec();
        let total = slice.len() as u64;
        let has_more = (start_index + total) < all.len() as u64;
        Ok(ReadResult { data: slice, start_index, end_index: start_index + total, total, has_more })
    }

    /// Flush, then filter rows with `start_time <= _ts < end_time`
    /// (half-open, each bound optional), returning the earliest `limit`
    /// ascending or, if `reverse`, the latest `limit` descending.
    pub fn read_by_time(
        &self,
        name: &str,
        start_time: Option<f64>,
        end_time: Option<f64>,
        limit: u64,
        reverse: bool,
    ) -> Result<TimeReadResult> {
        self.flush(name)?;
        let all = self.decode_points(name)?;

        let mut matches: Vec<DataPoint> = all
            .into_iter()
            .filter(|p| {
                let ts = p.data.get(TS_KEY).and_then(Value::as_f64).unwrap_or(f64::NEG_INFINITY);
                start_time.is_none_or_ge(ts) && end_time.is_none_or_lt(ts)
            })
            .collect();

        let total_matches = matches.len();
        if reverse {
            matches.reverse();
        }
        let limited: Vec<DataPoint> = matches.into_iter().take(limit as usize).collect();
        let has_more = (limited.len() as usize) < total_matches;

        Ok(TimeReadResult { data: limited, start_time, end_time, has_more })
    }

    pub fn stats(&self, name: &str) -> Result<TrackMetadata> {
        self.flush(name)?;
        self.read_or_init_metadata(name)
    }

    pub fn list_all(&self) -> Result<Vec<TrackMetadata>> {
        self.flush_all()?;
        let tracks_dir = self.resolver.tracks_dir();
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&tracks_dir) else { return Ok(out) };
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage_io(&tracks_dir, e))?;
            if !entry.file_type().map_err(|e| Error::storage_io(&tracks_dir, e))?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(self.read_or_init_metadata(&name)?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Half-open-bound helpers so `None` means "unbounded" without repeating the
/// `Option::map(..).unwrap_or(true)` dance at every call site.
trait BoundExt {
    fn is_none_or_ge(&self, ts: f64) -> bool;
    fn is_none_or_lt(&self, ts: f64) -> bool;
}

impl BoundExt for Option<f64> {
    fn is_none_or_ge(&self, ts: f64) -> bool {
        self.map(|s| ts >= s).unwrap_or(true)
    }
    fn is_none_or_lt(&self, ts: f64) -> bool {
        self.map(|e| ts < e).unwrap_or(true)
    }
}

/// Group rows by `_ts`; within a group, later rows overwrite earlier rows'
/// fields. Groups are then sorted ascending by `_ts`.
fn merge_by_timestamp(rows: Vec<BTreeMap<String, Value>>) -> Vec<BTreeMap<String, Value>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, BTreeMap<String, Value>> = HashMap::new();

    for row in rows {
        let ts = row.get(TS_KEY).and_then(Value::as_f64).unwrap_or(0.0);
        let key = ts.to_bits().to_string();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().extend(row);
    }

    let mut merged: Vec<BTreeMap<String, Value>> = order.into_iter().map(|k| groups.remove(&k).unwrap()).collect();
    merged.sort_by(|a, b| {
        let ta = a.get(TS_KEY).and_then(Value::as_f64).unwrap_or(0.0);
        let tb = b.get(TS_KEY).and_then(Value::as_f64).unwrap_or(0.0);
        ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}
