//! Persistent key-value state for identity records and session pointers.
//!
//! This store is separate from the vault's envelope store: it holds small
//! SDK-internal records (device identity, session pointer) that are not
//! themselves secret but must survive process restarts.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use crate::error::TrustError;

/// Atomic persistent store for small named records.
pub trait StateStore: Send + Sync {
    /// Reads the record stored under `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, TrustError>;

    /// Writes `bytes` atomically under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), TrustError>;

    /// Deletes the record under `name`; deleting a missing record is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, name: &str) -> Result<(), TrustError>;
}

/// In-memory store for tests and ephemeral processes.
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, TrustError> {
        let guard = self
            .records
            .lock()
            .map_err(|_| TrustError::Storage("state mutex poisoned".to_string()))?;
        Ok(guard.get(name).cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), TrustError> {
        self.records
            .lock()
            .map_err(|_| TrustError::Storage("state mutex poisoned".to_string()))?
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), TrustError> {
        self.records
            .lock()
            .map_err(|_| TrustError::Storage("state mutex poisoned".to_string()))?
            .remove(name);
        Ok(())
    }
}

/// Filesystem-backed store writing each record as a file under one
/// directory, with write-then-rename atomicity.
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TrustError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| TrustError::Storage(err.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // Record names are hex encoded so arbitrary names cannot escape the
        // store directory.
        self.dir.join(format!("{}.bin", hex::encode(name)))
    }
}

impl StateStore for FsStateStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, TrustError> {
        match fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TrustError::Storage(err.to_string())),
        }
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), TrustError> {
        let path = self.path_for(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|err| TrustError::Storage(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| TrustError::Storage(err.to_string()))
    }

    fn delete(&self, name: &str) -> Result<(), TrustError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TrustError::Storage(err.to_string())),
        }
    }
}
