use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

const DEFAULT_ROOT_KEY: &str = "default_root";
const DEFAULT_URL_KEY: &str = "default_url";

/// CLI-local configuration, stored as a toml document so user comments and
/// formatting survive a `save` after a `load`.
pub struct Config {
    pub default_root: Option<PathBuf>,
    pub default_url: Option<String>,
    path: PathBuf,
    doc: toml_edit::DocumentMut,
}

impl Config {
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = dirs::config_dir().context("could not determine the user config directory")?;
        Ok(home.join("dreamlake").join("config.toml"))
    }

    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let doc = contents.parse::<toml_edit::DocumentMut>().with_context(|| format!("config file {} is invalid", path.display()))?;
                let default_root = doc.get(DEFAULT_ROOT_KEY).and_then(|v| v.as_str()).map(PathBuf::from);
                let default_url = doc.get(DEFAULT_URL_KEY).and_then(|v| v.as_str()).map(str::to_string);
                Ok(Self { default_root, default_url, path, doc })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Ok(Self { default_root: None, default_url: None, path, doc: toml_edit::DocumentMut::new() })
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn set_default_root(&mut self, root: &Path) {
        self.default_root = Some(root.to_path_buf());
        self.doc[DEFAULT_ROOT_KEY] = toml_edit::value(root.to_string_lossy().into_owned());
    }

    pub fn set_default_url(&mut self, url: &str) {
        self.default_url = Some(url.to_string());
        self.doc[DEFAULT_URL_KEY] = toml_edit::value(url);
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("unable to create {}", parent.display()))?;
        }
        // Guard against racy concurrent `dreamlake config set` invocations
        // clobbering each other's writes.
        let _lock = crate::lockfile::Lockfile::for_path(&self.path)?;
        std::fs::write(&self.path, self.doc.to_string()).with_context(|| format!("failed to save {}", self.path.display()))
    }
}
