//! Storage backends for sealed envelopes.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use crate::error::VaultError;

const VAULT_EXTENSION: &str = "vault";

/// Blob storage for sealed envelopes, addressed by entry key.
pub trait VaultBackend: Send + Sync {
    /// Reads the envelope stored under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError>;

    /// Writes `bytes` atomically under `key`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), VaultError>;

    /// Deletes the entry under `key`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, key: &str) -> Result<bool, VaultError>;

    /// Lists the keys of all stored entries, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self) -> Result<Vec<String>, VaultError>;
}

/// In-memory backend for tests.
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let guard = self
            .entries
            .lock()
            .map_err(|_| VaultError::Backend("vault mutex poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), VaultError> {
        self.entries
            .lock()
            .map_err(|_| VaultError::Backend("vault mutex poisoned".to_string()))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, VaultError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| VaultError::Backend("vault mutex poisoned".to_string()))?
            .remove(key)
            .is_some())
    }

    fn list(&self) -> Result<Vec<String>, VaultError> {
        let guard = self
            .entries
            .lock()
            .map_err(|_| VaultError::Backend("vault mutex poisoned".to_string()))?;
        Ok(guard.keys().cloned().collect())
    }
}

/// Filesystem backend writing one file per entry.
///
/// Entry keys are hex encoded in filenames so arbitrary keys cannot escape
/// the vault directory; writes go through a temp file and rename.
pub struct FsBackend {
    dir: PathBuf,
}

impl FsBackend {
    /// Opens (and creates if needed) a vault directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| VaultError::Backend(err.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{VAULT_EXTENSION}", hex::encode(key)))
    }
}

impl VaultBackend for FsBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::Backend(err.to_string())),
        }
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), VaultError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|err| VaultError::Backend(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| VaultError::Backend(err.to_string()))
    }

    fn delete(&self, key: &str) -> Result<bool, VaultError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VaultError::Backend(err.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<String>, VaultError> {
        let mut keys = Vec::new();
        let entries =
            fs::read_dir(&self.dir).map_err(|err| VaultError::Backend(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| VaultError::Backend(err.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(&format!(".{VAULT_EXTENSION}")) else {
                continue;
            };
            let Ok(decoded) = hex::decode(stem) else {
                continue;
            };
            if let Ok(key) = String::from_utf8(decoded) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert!(backend.read("token").expect("read").is_none());
        backend.write_atomic("token", b"sealed").expect("write");
        assert_eq!(backend.read("token").expect("read"), Some(b"sealed".to_vec()));
        assert_eq!(backend.list().expect("list"), vec!["token".to_string()]);
        assert!(backend.delete("token").expect("delete"));
        assert!(!backend.delete("token").expect("delete"));
    }

    #[test]
    fn test_fs_backend_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path()).expect("open");
        backend.write_atomic("auth/token", b"sealed").expect("write");
        backend.write_atomic("pin", b"sealed-2").expect("write");

        assert_eq!(
            backend.read("auth/token").expect("read"),
            Some(b"sealed".to_vec())
        );
        let mut keys = backend.list().expect("list");
        keys.sort();
        assert_eq!(keys, vec!["auth/token".to_string(), "pin".to_string()]);

        assert!(backend.delete("auth/token").expect("delete"));
        assert!(backend.read("auth/token").expect("read").is_none());
    }

    #[test]
    fn test_fs_backend_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path()).expect("open");
        backend.write_atomic("k", b"v1").expect("write");
        backend.write_atomic("k", b"v2").expect("write");
        assert_eq!(backend.read("k").expect("read"), Some(b"v2".to_vec()));
    }
}
