//! Rollback management.
//!
//! Keeps copies of application bundles taken before they are replaced.
//! This module provides:
//! - Backup creation before a destructive install step
//! - Listing backups per application, newest first
//! - Restoring a backup to a destination, with integrity verification
//! - Retention pruning (keep latest N per application)
//!
//! Records are keyed by `(identifier, version)`. A backup directory only
//! becomes visible once it is complete: it is written under a `.partial-`
//! name and renamed into place after its metadata is on disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{Checksum, ChecksumVerifier};
use crate::error::UpdateError;
use crate::fs_utils::{copy_tree, move_path, path_exists, remove_path};

/// Metadata file name within backup directories.
const METADATA_FILE: &str = "metadata.json";
/// Backed-up bundle name within backup directories.
const ARTIFACT_NAME: &str = "artifact";
/// Hash file name for integrity verification.
const HASH_FILE: &str = "hash.sha256";
/// Prefix of backup directories still being written.
const PARTIAL_PREFIX: &str = ".partial-";

/// Manages application backups.
///
/// # Backup Directory Structure
///
/// ```text
/// backup_dir/
/// └── com.example.editor/
///     ├── backup-4.1-1704067200000/
///     │   ├── artifact/           # The backed up bundle
///     │   ├── metadata.json       # BackupRecord
///     │   └── hash.sha256         # SHA-256 of artifact
///     └── backup-4.2-1704153600000/
///         └── ...
/// ```
#[derive(Debug, Clone)]
pub struct RollbackStore {
    /// Directory for storing backups
    backup_dir: PathBuf,
    /// Maximum number of backups to retain per application
    max_backups: usize,
    verifier: ChecksumVerifier,
}

/// A retained backup of one application version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Application identifier
    pub identifier: String,
    /// Version that was backed up
    pub version: String,
    /// Backup directory
    pub location: PathBuf,
    /// Where the bundle was installed when it was backed up
    pub original_path: PathBuf,
    /// When the backup was created
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the backed-up bundle
    pub checksum: String,
}

impl BackupRecord {
    /// Path to the backed up bundle.
    pub fn artifact_path(&self) -> PathBuf {
        self.location.join(ARTIFACT_NAME)
    }

    /// Path to the metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.location.join(METADATA_FILE)
    }

    /// Path to the hash file.
    pub fn hash_path(&self) -> PathBuf {
        self.location.join(HASH_FILE)
    }

    pub fn checksum(&self) -> Result<Checksum, UpdateError> {
        self.checksum.parse()
    }

    /// Check if the backup directory and bundle exist.
    pub fn exists(&self) -> bool {
        self.location.is_dir() && path_exists(&self.artifact_path())
    }
}

impl RollbackStore {
    /// Create a new rollback store.
    ///
    /// * `backup_dir` - Directory where backups will be stored
    /// * `max_backups` - Backups retained per application by [`prune`](Self::prune)
    pub fn new(backup_dir: PathBuf, max_backups: usize) -> Self {
        Self {
            backup_dir,
            max_backups,
            verifier: ChecksumVerifier::new(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    fn app_dir(&self, identifier: &str) -> PathBuf {
        self.backup_dir.join(sanitize_component(identifier))
    }

    /// Back up `source` as `(identifier, version)`.
    ///
    /// The returned record's checksum is computed over the copy, not the
    /// original, so callers can compare it against a fresh hash of the
    /// original to detect a bad copy.
    pub fn create_backup(
        &self,
        identifier: &str,
        version: &str,
        source: &Path,
    ) -> Result<BackupRecord, UpdateError> {
        let app_dir = self.app_dir(identifier);
        fs::create_dir_all(&app_dir)?;

        let now = Utc::now();
        let name = unique_backup_name(&app_dir, version, &now);
        let partial = app_dir.join(format!("{PARTIAL_PREFIX}{name}"));
        let final_dir = app_dir.join(&name);

        info!(
            app = identifier,
            version,
            source = %source.display(),
            "Creating backup"
        );

        let result = (|| -> Result<BackupRecord, UpdateError> {
            fs::create_dir_all(&partial)?;
            copy_tree(source, &partial.join(ARTIFACT_NAME))?;

            let checksum = self.verifier.hash(&partial.join(ARTIFACT_NAME))?;
            fs::write(partial.join(HASH_FILE), checksum.to_hex())?;

            let record = BackupRecord {
                identifier: identifier.to_string(),
                version: version.to_string(),
                location: final_dir.clone(),
                original_path: source.to_path_buf(),
                created_at: now,
                checksum: checksum.to_hex(),
            };
            fs::write(
                partial.join(METADATA_FILE),
                serde_json::to_string_pretty(&record)?,
            )?;
            fs::rename(&partial, &final_dir)?;
            Ok(record)
        })();

        if result.is_err() {
            let _ = remove_path(&partial);
        }
        let record = result?;
        debug!(location = %record.location.display(), checksum = %record.checksum, "Backup created");
        Ok(record)
    }

    /// Backups for `identifier`, sorted newest first.
    ///
    /// Directories with unreadable metadata are skipped with a warning.
    pub fn list(&self, identifier: &str) -> Result<Vec<BackupRecord>, UpdateError> {
        let app_dir = self.app_dir(identifier);
        let mut records = Vec::new();

        if !app_dir.exists() {
            return Ok(records);
        }

        for entry in fs::read_dir(&app_dir)? {
            let path = entry?.path();
            let is_partial = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
            if !path.is_dir() || is_partial {
                continue;
            }

            let metadata_path = path.join(METADATA_FILE);
            match fs::read_to_string(&metadata_path) {
                Ok(content) => match serde_json::from_str::<BackupRecord>(&content) {
                    Ok(mut record) => {
                        // The store may have been relocated since the record was written
                        record.location = path;
                        records.push(record);
                    }
                    Err(e) => {
                        warn!("Failed to parse backup metadata at {:?}: {}", metadata_path, e);
                    }
                },
                Err(e) => {
                    debug!("Skipping backup directory {:?}: {}", path, e);
                }
            }
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.location.cmp(&a.location))
        });
        Ok(records)
    }

    /// Identifiers that have at least one backup directory.
    pub fn identifiers(&self) -> Result<Vec<String>, UpdateError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut identifiers = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    identifiers.push(name.to_string());
                }
            }
        }
        identifiers.sort();
        Ok(identifiers)
    }

    /// Most recent backup for `identifier`.
    pub fn latest(&self, identifier: &str) -> Result<Option<BackupRecord>, UpdateError> {
        Ok(self.list(identifier)?.into_iter().next())
    }

    /// Most recent backup for `(identifier, version)`.
    pub fn find(&self, identifier: &str, version: &str) -> Result<Option<BackupRecord>, UpdateError> {
        Ok(self
            .list(identifier)?
            .into_iter()
            .find(|record| record.version == version))
    }

    /// Re-hash the backed-up bundle and compare with the stored hash.
    pub fn verify_integrity(&self, record: &BackupRecord) -> Result<bool, UpdateError> {
        let artifact = record.artifact_path();
        let hash_path = record.hash_path();
        if !path_exists(&artifact) || !hash_path.exists() {
            return Ok(false);
        }

        let stored: Checksum = fs::read_to_string(&hash_path)?.trim().parse()?;
        let computed = self.verifier.hash(&artifact)?;
        Ok(stored == computed && computed.to_hex() == record.checksum)
    }

    /// Restore `record` to `dest`.
    ///
    /// The current destination is moved aside and only deleted once the
    /// restored bundle hashes to the recorded checksum; on any failure the
    /// aside copy is moved back.
    pub fn restore(&self, record: &BackupRecord, dest: &Path) -> Result<(), UpdateError> {
        info!(
            app = %record.identifier,
            version = %record.version,
            dest = %dest.display(),
            "Restoring backup"
        );

        if !record.exists() || !self.verify_integrity(record)? {
            warn!("Backup integrity verification failed for {:?}", record.location);
            return Err(UpdateError::BackupCorrupted);
        }
        let expected = record.checksum()?;

        let aside = aside_path(dest);
        let had_dest = path_exists(dest);
        if had_dest {
            remove_path(&aside)?;
            fs::rename(dest, &aside)?;
        }

        let restored = copy_tree(&record.artifact_path(), dest)
            .map_err(UpdateError::from)
            .and_then(|()| self.verifier.verify(dest, &expected));

        match restored {
            Ok(()) => {
                if had_dest {
                    if let Err(e) = remove_path(&aside) {
                        warn!("Failed to remove displaced bundle {:?}: {}", aside, e);
                    }
                }
                info!(app = %record.identifier, version = %record.version, "Backup restored");
                Ok(())
            }
            Err(e) => {
                let _ = remove_path(dest);
                if had_dest {
                    move_path(&aside, dest).map_err(|undo| {
                        UpdateError::RollbackFailed(format!(
                            "restore failed ({e}) and displaced bundle could not be put back: {undo}"
                        ))
                    })?;
                }
                Err(UpdateError::RollbackFailed(e.to_string()))
            }
        }
    }

    /// Restore `record` to `dest` and drop it from the store.
    pub fn consume(&self, record: &BackupRecord, dest: &Path) -> Result<(), UpdateError> {
        self.restore(record, dest)?;
        self.discard(record)
    }

    /// Delete a backup directory.
    pub fn discard(&self, record: &BackupRecord) -> Result<(), UpdateError> {
        if record.location.exists() {
            fs::remove_dir_all(&record.location)?;
            info!("Deleted backup: {:?}", record.location);
        }
        Ok(())
    }

    /// Keep the newest `keep` backups of `identifier`; returns how many were removed.
    pub fn prune(&self, identifier: &str, keep: usize) -> Result<usize, UpdateError> {
        let records = self.list(identifier)?;
        let mut removed = 0;

        // List is sorted newest first
        for record in records.iter().skip(keep) {
            info!("Removing old backup: {:?}", record.location);
            match fs::remove_dir_all(&record.location) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove old backup {:?}: {}", record.location, e),
            }
        }
        Ok(removed)
    }

    /// Apply the configured retention to one application.
    pub fn apply_retention(&self, identifier: &str) -> Result<usize, UpdateError> {
        self.prune(identifier, self.max_backups)
    }

    /// Apply the configured retention to every application.
    pub fn prune_all(&self) -> Result<usize, UpdateError> {
        let mut removed = 0;
        for identifier in self.identifiers()? {
            removed += self.prune(&identifier, self.max_backups)?;
        }
        Ok(removed)
    }
}

fn unique_backup_name(app_dir: &Path, version: &str, now: &DateTime<Utc>) -> String {
    let base = format!(
        "backup-{}-{}",
        sanitize_component(version),
        now.timestamp_millis()
    );
    let mut name = base.clone();
    let mut n = 1;
    while app_dir.join(&name).exists() || app_dir.join(format!("{PARTIAL_PREFIX}{name}")).exists() {
        name = format!("{base}-{n}");
        n += 1;
    }
    name
}

/// Sibling path a bundle is moved to while it is being replaced.
pub(crate) fn aside_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.warden-old"))
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}
