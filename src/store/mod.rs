//! On-disk JSON persistence shared by the archiver and the name reconciler.
//!
//! Every file this crate owns is a single JSON document. Reads distinguish a
//! missing file (nothing to do) from a file that exists but does not parse
//! (a data-integrity fault). Writes go to a sibling temp file and are renamed
//! into place so readers never see a partial document.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod history;
pub mod models;

pub use history::HistoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("data integrity fault in {path}: {reason}")]
    DataIntegrity { path: PathBuf, reason: String },

    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn integrity(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::DataIntegrity {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::DataIntegrity { .. })
    }
}

/// Read and parse a JSON document. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::integrity(path, e.to_string()))
}

/// Like `read_json`, but the document root must be a JSON object. Derived
/// struct deserializers also accept arrays, so the shape is checked first.
pub fn read_json_object<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(value) = read_json::<serde_json::Value>(path)? else {
        return Ok(None);
    };
    if !value.is_object() {
        return Err(StoreError::integrity(path, "document root is not an object"));
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StoreError::integrity(path, e.to_string()))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    }

    let tmp = tmp_path(path);
    let write_tmp = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(&tmp, e));
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }

    debug!("Wrote {} ({} bytes)", path.display(), json.len());
    Ok(())
}

/// `foo.json` → `foo.json.tmp`, kept in the same directory so the rename
/// never crosses filesystems.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
