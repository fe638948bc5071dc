//! # Storage
//!
//! Durable storage of a single serialized document, used by both the
//! `ResolveCache` snapshot and the `ApplyLedger`.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, warn};

use crate::error::StorageError;
use crate::metrics_consts::STORAGE_CORRUPTION_RESET_COUNTER;

/// A place to keep one serialized document. Implementations must be thread-safe.
pub trait Storage: Send + Sync {
    /// Returns `None` if nothing was ever saved (or it was cleared).
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored document with `bytes`.
    fn save(&self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove the stored document. Clearing empty storage is not an error.
    fn clear(&self) -> Result<(), StorageError>;

    /// A human readable location, for logging.
    fn location(&self) -> String;
}

/// Stores the document in a single file.
/// Writes go to a sibling temporary file first and are renamed into place, so a
/// crash mid-write leaves either the previous or the new document behind.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage for `file_name` inside `dir`, creating `dir` if needed.
    pub fn in_dir(dir: &Path, file_name: &str) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|error| StorageError::Io {
            path: dir.display().to_string(),
            error,
        })?;
        Ok(Self::new(dir.join(file_name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, error: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.location(),
            error,
        }
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(self.io_error(error)),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let temporary = self.temporary_path();
        fs::write(&temporary, bytes).map_err(|e| self.io_error(e))?;
        fs::rename(&temporary, &self.path).map_err(|e| self.io_error(e))
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(self.io_error(error)),
        }
    }

    fn location(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Keeps the document in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    document: Mutex<Option<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-loaded with `bytes`, as if a previous process had saved them.
    pub fn with_document(bytes: &[u8]) -> Self {
        Self {
            document: Mutex::new(Some(bytes.to_vec())),
        }
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        *self
            .document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(bytes.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self
            .document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

pub fn encode<T: Serialize>(document: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(document)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupted(e.to_string()))
}

/// Load the document kept in `storage`, falling back to `T::default()` when there is none.
///
/// A document that cannot be decoded is considered corrupted: it is wiped so
/// that the next save starts from a clean slate, and the default is returned.
/// Failing to read the storage at all is not corruption and is returned as is,
/// leaving the document in place.
pub fn load_or_reset<T: DeserializeOwned + Default>(
    storage: &dyn Storage,
) -> Result<T, StorageError> {
    let bytes = match storage.load() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(T::default()),
        Err(e) => {
            error!(location = %storage.location(), "failed to read persistent state: {}", e);
            return Err(e);
        }
    };

    match decode(&bytes) {
        Ok(document) => Ok(document),
        Err(e) => {
            warn!(
                location = %storage.location(),
                "discarding corrupted persistent state: {}", e
            );
            metrics::counter!(STORAGE_CORRUPTION_RESET_COUNTER, "location" => storage.location())
                .increment(1);
            if let Err(e) = storage.clear() {
                error!(location = %storage.location(), "failed to wipe storage: {}", e);
            }
            Ok(T::default())
        }
    }
}
