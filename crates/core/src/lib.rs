//! Dreamlake session store engine: buffers and merges timestamped track
//! samples, serializes them into a mixed row/columnar append log, flattens
//! and merges hyperparameter trees, maintains a locked file metadata
//! sidecar, and coordinates concurrent writers within one process against
//! the same session.

pub mod atomic;
pub mod codec;
pub mod error;
pub mod files;
pub mod lock;
pub mod logs;
pub mod params;
pub mod path_resolver;
pub mod remote;
pub mod session;
pub mod track;

pub use error::{Error, Result};
pub use files::{FileEntry, FileStore, UploadOptions};
pub use lock::FileLock;
pub use logs::{LogRecord, LogStore};
pub use params::ParamStore;
pub use path_resolver::PathResolver;
pub use session::{with_session, Mode, Session, SessionConfig};
pub use track::{BatchResult, DataPoint, ReadResult, TimeReadResult, TrackEngine, TrackMetadata};
