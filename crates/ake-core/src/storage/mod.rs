//! Durable, crash-safe record storage.
//!
//! The store is a directory tree of JSON records. It is the only component
//! that touches the filesystem; everything else works on in-memory structs
//! obtained through [`Store::load`] and [`Store::commit_atomic`].
//!
//! Writes go to a uniquely named temporary file in the target directory,
//! are fsynced, and are then renamed over the target, so a reader sees
//! either the old record or the new one and never a partial write.
//! Read/modify/write cycles are serialized per key by [`lock::KeyLock`].

pub mod key;
pub mod lock;

pub use key::StoreKey;
pub use lock::KeyLock;

use ake_config::LockSettings;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error during {operation} on {key}: {source}")]
    Io {
        operation: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {key} has incompatible schema version {version}")]
    IncompatibleSchema { key: String, version: String },

    #[error("lock contention on {key}: gave up after {attempts} attempts")]
    ConcurrencyExhausted { key: String, attempts: u32 },
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, key: &str, source: std::io::Error) -> Self {
        StorageError::Io {
            operation,
            key: key.to_string(),
            source,
        }
    }
}

impl From<StorageError> for ake_common::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConcurrencyExhausted { key, attempts } => {
                ake_common::Error::ConcurrencyExhausted { key, attempts }
            }
            StorageError::Io {
                operation,
                key,
                source,
            } => ake_common::Error::StorageIo {
                operation: operation.to_string(),
                key,
                message: source.to_string(),
            },
            StorageError::Json { key, source } => ake_common::Error::StorageIo {
                operation: "decode".to_string(),
                key,
                message: source.to_string(),
            },
            StorageError::IncompatibleSchema { key, version } => ake_common::Error::StorageIo {
                operation: "decode".to_string(),
                key,
                message: format!("incompatible schema version {version}"),
            },
        }
    }
}

/// Handle to the on-disk store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    lock: LockSettings,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, lock: LockSettings) -> Self {
        Self {
            root: root.into(),
            lock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_settings(&self) -> &LockSettings {
        &self.lock
    }

    pub fn path_of(&self, key: &StoreKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Whether a record exists at `key`.
    pub fn exists(&self, key: &StoreKey) -> bool {
        self.path_of(key).is_file()
    }

    /// Load and decode the record at `key`; `Ok(None)` when absent.
    pub fn load<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Option<T>, StorageError> {
        match self.read_bytes(key)? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Raw bytes at `key`; `Ok(None)` when absent.
    pub fn read_bytes(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_of(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io("read", key.as_str(), e)),
        }
    }

    /// Locked read/modify/write of one record.
    ///
    /// The mutator sees the current record (`None` when absent) and may
    /// replace it. If it returns an error, or leaves `None`, nothing is
    /// written. A record whose serialized form is unchanged is not rewritten.
    pub fn commit_atomic<T, R, E, F>(&self, key: &StoreKey, mutate: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnOnce(&mut Option<T>) -> Result<R, E>,
    {
        let target = self.path_of(key);
        self.ensure_parent(key, &target)?;
        let _guard = KeyLock::acquire(&lock::lock_path_for(&target), key.as_str(), &self.lock)?;

        let original = self.read_bytes(key)?;
        let mut slot: Option<T> = match &original {
            Some(bytes) => Some(decode(key, bytes)?),
            None => None,
        };

        let result = mutate(&mut slot)?;

        if let Some(record) = &slot {
            let encoded = encode(key, record)?;
            if original.as_deref() != Some(encoded.as_slice()) {
                self.replace(key, &target, &encoded)?;
                debug!(key = %key, bytes = encoded.len(), "record committed");
            }
        }
        Ok(result)
    }

    /// Atomically replace the bytes at `key` (used for non-record artifacts).
    pub fn write_atomic(&self, key: &StoreKey, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.path_of(key);
        self.ensure_parent(key, &target)?;
        let _guard = KeyLock::acquire(&lock::lock_path_for(&target), key.as_str(), &self.lock)?;
        self.replace(key, &target, bytes)
    }

    /// Atomically replace a whole file without a read/modify/write cycle.
    ///
    /// No lock is taken and no lock file is created: the rename alone decides
    /// which concurrent writer wins.
    pub fn publish(&self, key: &StoreKey, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.path_of(key);
        self.ensure_parent(key, &target)?;
        self.replace(key, &target, bytes)
    }

    /// Write `record` at `key` only if nothing is there yet.
    ///
    /// Returns `false` when another writer got there first. Used for
    /// write-once keys, which never need a lock file.
    pub fn create_once<T: Serialize>(&self, key: &StoreKey, record: &T) -> Result<bool, StorageError> {
        let target = self.path_of(key);
        self.ensure_parent(key, &target)?;
        let encoded = encode(key, record)?;
        let tmp_path = self.write_temp(key, &target, &encoded)?;

        // A hard link never clobbers an existing target.
        let linked = fs::hard_link(&tmp_path, &target);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => {
                sync_dir(target.parent());
                debug!(key = %key, "record created");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::io("link", key.as_str(), e)),
        }
    }

    /// Delete the file at `key`; `Ok(false)` when it was already absent.
    pub fn remove(&self, key: &StoreKey) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io("remove", key.as_str(), e)),
        }
    }

    /// Keys of all records with extension `ext` directly under `dir`.
    pub fn list(&self, dir: &str, ext: &str) -> Result<Vec<StoreKey>, StorageError> {
        let path = self.root.join(dir);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("list", dir, e)),
        };

        let suffix = format!(".{ext}");
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list", dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(&suffix) && !name.starts_with('.') {
                keys.push(StoreKey::from_relative(format!("{dir}/{name}")));
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(keys)
    }

    fn ensure_parent(&self, key: &StoreKey, target: &Path) -> Result<(), StorageError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create dir", key.as_str(), e))?;
        }
        Ok(())
    }

    /// Write to a temporary sibling, fsync, rename over the target.
    fn replace(&self, key: &StoreKey, target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp_path = self.write_temp(key, target, bytes)?;
        if let Err(e) = fs::rename(&tmp_path, target) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StorageError::io("rename", key.as_str(), e));
        }

        sync_dir(target.parent());
        Ok(())
    }

    /// Fully written and fsynced temporary sibling of `target`.
    fn write_temp(&self, key: &StoreKey, target: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp_path = target.with_file_name(format!(
            ".{}.{}.tmp",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(StorageError::io("write temp", key.as_str(), e));
        }
        Ok(tmp_path)
    }
}

/// Persist the rename itself; failure only weakens durability, not atomicity.
fn sync_dir(dir: Option<&Path>) {
    #[cfg(unix)]
    if let Some(dir) = dir {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn decode<T: DeserializeOwned>(key: &StoreKey, bytes: &[u8]) -> Result<T, StorageError> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| StorageError::Json {
        key: key.to_string(),
        source: e,
    })?;
    if let Some(version) = value.get("schema_version").and_then(|v| v.as_str()) {
        if !ake_common::schema::is_compatible(version) {
            return Err(StorageError::IncompatibleSchema {
                key: key.to_string(),
                version: version.to_string(),
            });
        }
    }
    serde_json::from_value(value).map_err(|e| StorageError::Json {
        key: key.to_string(),
        source: e,
    })
}

fn encode<T: Serialize>(key: &StoreKey, record: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Json {
        key: key.to_string(),
        source: e,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}
