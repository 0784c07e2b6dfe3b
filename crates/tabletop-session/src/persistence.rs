#![forbid(unsafe_code)]

//! Key-value persistence for session state.
//!
//! The session stores two named blobs: the serialized game tree and the undo
//! history. [`StorageBackend`] abstracts where they go.
//!
//! # Backends
//!
//! - [`MemoryStorage`]: in-process, for tests and ephemeral sessions
//! - [`FileStorage`]: one file per key in a directory, written atomically
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Missing key | First run | `load` returns `Ok(None)` |
//! | Interrupted write | Crash mid-save | Temp file left behind; previous blob intact |
//! | Bad key | Empty or contains path separators | [`StorageError::InvalidKey`] |

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Keys must be non-empty and use only `[A-Za-z0-9_-]`.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
    /// A stored blob could not be decoded.
    #[error("storage corruption: {0}")]
    Corruption(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Named-blob store.
pub trait StorageBackend: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Read a blob. `Ok(None)` when nothing was stored under `key`.
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the blob stored under `key`.
    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Delete the blob stored under `key`, if any.
    fn remove(&self, key: &str) -> StorageResult<()>;

    fn is_available(&self) -> bool {
        true
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().map_or(0, |data| data.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        "MemoryStorage"
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        check_key(key)?;
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Unavailable("lock poisoned".into()))?;
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &str, blob: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Unavailable("lock poisoned".into()))?;
        data.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        check_key(key)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Unavailable("lock poisoned".into()))?;
        data.remove(key);
        Ok(())
    }
}

/// Directory of `<key>.json` files, each written via a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{key}.json.tmp"))
    }
}

impl StorageBackend for FileStorage {
    fn name(&self) -> &str {
        "FileStorage"
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        check_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        fs::create_dir_all(&self.dir)?;

        let tmp = self.temp_path_for(key);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp, self.path_for(key)) {
            warn!(target: "tabletop.session", key, error = %err, "atomic rename failed");
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(target: "tabletop.session", key, bytes = data.len(), "blob saved");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        check_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_available(&self) -> bool {
        fs::create_dir_all(&self.dir).is_ok()
    }
}
