use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default on-disk root used when a session does not specify one explicitly.
pub const DEFAULT_ROOT: &str = ".dreamlake";

/// Turns a session prefix (`"ws/.../name"`) into its workspace/name pair and
/// resolves the on-disk path of every artifact kind beneath the session
/// directory.
///
/// `workspace` is `parts[-2]` and `name` is `parts[-1]`; any intermediate
/// segments are preserved literally in the on-disk path.
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
    prefix: String,
    workspace: String,
    name: String,
}

impl PathResolver {
    pub fn new(prefix: &str, root: Option<&Path>) -> Result<Self> {
        let trimmed = prefix.trim_matches('/');
        let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() < 2 {
            return Err(Error::InvalidPrefix(prefix.to_string()));
        }
        let workspace = parts[parts.len() - 2].to_string();
        let name = parts[parts.len() - 1].to_string();
        let root = root.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        Ok(Self { root, prefix: trimmed.to_string(), workspace, name })
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Root of the session directory, `<root>/<prefix>/`.
    pub fn session_dir(&self) -> PathBuf {
        self.root.join(&self.prefix)
    }

    pub fn session_json(&self) -> PathBuf {
        self.session_dir().join("session.json")
    }

    pub fn session_lock(&self) -> PathBuf {
        self.session_dir().join(".session.lock")
    }

    pub fn parameters_json(&self) -> PathBuf {
        self.session_dir().join("parameters.json")
    }

    pub fn parameters_lock(&self) -> PathBuf {
        self.session_dir().join(".parameters.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.session_dir().join("logs")
    }

    pub fn logs_jsonl(&self) -> PathBuf {
        self.logs_dir().join("logs.jsonl")
    }

    pub fn logs_lock(&self) -> PathBuf {
        self.logs_dir().join(".logs.lock")
    }

    fn track_dir(&self, track: &str) -> PathBuf {
        self.session_dir().join("tracks").join(track)
    }

    pub fn track_data_msgpack(&self, track: &str) -> PathBuf {
        self.track_dir(track).join("data.msgpack")
    }

    pub fn track_metadata_json(&self, track: &str) -> PathBuf {
        self.track_dir(track).join("metadata.json")
    }

    pub fn track_metadata_lock(&self, track: &str) -> PathBuf {
        self.track_dir(track).join(".metadata.lock")
    }

    pub fn tracks_dir(&self) -> PathBuf {
        self.session_dir().join("tracks")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.session_dir().join("files")
    }

    pub fn file_blob(&self, id: &str, filename: &str) -> PathBuf {
        self.files_dir().join(id).join(filename)
    }

    pub fn files_metadata_json(&self) -> PathBuf {
        self.files_dir().join(".files_metadata.json")
    }

    pub fn files_metadata_lock(&self) -> PathBuf {
        self.files_dir().join(".files_metadata.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_workspace_and_name() {
        let r = PathResolver::new("team-a/robots/arm-01", None).unwrap();
        assert_eq!(r.workspace(), "robots");
        assert_eq!(r.name(), "arm-01");
        assert_eq!(r.session_dir(), PathBuf::from(".dreamlake/team-a/robots/arm-01"));
    }

    #[test]
    fn rejects_single_segment() {
        assert!(PathResolver::new("onlyone", None).is_err());
        assert!(PathResolver::new("", None).is_err());
    }

    #[test]
    fn trims_slashes() {
        let r = PathResolver::new("/ws/name/", None).unwrap();
        assert_eq!(r.workspace(), "ws");
        assert_eq!(r.name(), "name");
    }

    #[test]
    fn custom_root() {
        let r = PathResolver::new("ws/name", Some(Path::new("/tmp/store"))).unwrap();
        assert_eq!(r.session_dir(), PathBuf::from("/tmp/store/ws/name"));
    }
}
