//! Crash-safe keyed snapshot persistence.
//!
//! This module provides:
//! - SnapshotStore: keyed blob storage with atomic writes
//! - Temp-write + verify + backup + rename discipline
//! - Backup fallback on load and restore-on-failure recovery
//!
//! Both the aggregated session state and per-user profile snapshots
//! are stored through this primitive.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Current on-disk schema version.
pub const STORE_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid snapshot key.
    #[error("Invalid snapshot key: {0}")]
    InvalidKey(String),

    /// Neither the primary file nor its backup exists.
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// The file exists but does not parse as a snapshot envelope.
    #[error("Corrupted snapshot file: {0}")]
    Corrupted(String),

    /// Version mismatch.
    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: u32,
        /// Found version.
        found: u32,
    },

    /// Atomic write failed after the temp file was written.
    #[error("Atomic write failed: {0}")]
    AtomicWriteFailed(String),
}

/// Result type for snapshot operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for mirror_common::MirrorError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

/// Versioned envelope wrapped around every stored payload. Gives the
/// verify step a known top-level structure to check before the temp
/// file replaces anything.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    payload: serde_json::Value,
}

/// Crash-safe keyed snapshot store.
///
/// Writes go to `<key>.json.tmp`, are verified, then renamed over the
/// final path with the previous file kept as `<key>.json.bak`. A crash
/// at any point leaves either the old or the new file fully intact.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Creates a store rooted at the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn backup_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json.bak"))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json.tmp"))
    }

    /// Validates a snapshot key.
    fn validate_key(key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        let ok = key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !ok {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Checks whether a snapshot (or its backup) exists.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.path(key).exists() || self.backup_path(key).exists()
    }

    /// Saves a value under a key with atomic-write semantics.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        Self::validate_key(key)?;
        fs::create_dir_all(&self.dir)?;

        let envelope = SnapshotEnvelope {
            version: STORE_VERSION,
            payload: serde_json::to_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        };

        let temp = self.temp_path(key);
        let result = self.write_and_swap(key, &temp, &envelope);
        if result.is_err() {
            // Leave no temp file behind; restore the backup if the
            // final file went missing mid-swap.
            let _ = fs::remove_file(&temp);
            let final_path = self.path(key);
            let backup = self.backup_path(key);
            if !final_path.exists() && backup.exists() {
                warn!("Restoring backup for '{key}' after failed save");
                if let Err(e) = fs::rename(&backup, &final_path) {
                    error!("Failed to restore backup for '{key}': {e}");
                }
            }
        }
        result
    }

    fn write_and_swap(
        &self,
        key: &str,
        temp: &Path,
        envelope: &SnapshotEnvelope,
    ) -> StoreResult<()> {
        // Write to the temp file first.
        {
            let file = File::create(temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, envelope)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            writer.flush()?;
        }

        // Verify the temp file is non-empty and parses as an envelope
        // of the expected version before it replaces anything.
        let len = fs::metadata(temp)?.len();
        if len == 0 {
            return Err(StoreError::Corrupted(format!(
                "temp file for '{key}' is empty after write"
            )));
        }
        Self::read_envelope(temp)?;

        let final_path = self.path(key);
        let backup = self.backup_path(key);

        // Rotate the current file into the backup slot. Best-effort:
        // a failed backup is logged, not fatal.
        if final_path.exists() {
            if backup.exists() {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!("Could not delete old backup for '{key}': {e}");
                }
            }
            if let Err(e) = fs::rename(&final_path, &backup) {
                warn!("Could not create backup for '{key}': {e}");
            } else {
                debug!("Created backup for '{key}'");
            }
        }

        fs::rename(temp, &final_path)
            .map_err(|e| StoreError::AtomicWriteFailed(format!("'{key}': {e}")))?;

        debug!("Saved snapshot '{key}' ({len} bytes)");
        Ok(())
    }

    /// Loads a value by key, falling back to the backup file.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        Self::validate_key(key)?;

        let primary = self.path(key);
        let backup = self.backup_path(key);

        if primary.exists() {
            match Self::load_path(&primary) {
                Ok(value) => return Ok(value),
                Err(e) if backup.exists() => {
                    warn!("Primary snapshot '{key}' unreadable ({e}), trying backup");
                },
                Err(e) => return Err(e),
            }
        }

        if backup.exists() {
            info!("Loading snapshot '{key}' from backup");
            return Self::load_path(&backup);
        }

        Err(StoreError::NotFound(key.to_string()))
    }

    fn load_path<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
        let envelope = Self::read_envelope(path)?;
        serde_json::from_value(envelope.payload)
            .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))
    }

    fn read_envelope(path: &Path) -> StoreResult<SnapshotEnvelope> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let envelope: SnapshotEnvelope = serde_json::from_reader(reader)
            .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))?;

        if envelope.version > STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: envelope.version,
            });
        }
        Ok(envelope)
    }

    /// Deletes a snapshot and its backup.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        Self::validate_key(key)?;
        let primary = self.path(key);
        let backup = self.backup_path(key);
        if primary.exists() {
            fs::remove_file(&primary)?;
        }
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        Ok(())
    }
}
