//! Content hashing for integrity checks.
//!
//! The installer compares digests at three points (source artifact,
//! staged copy, installed destination), and the rollback store records a
//! digest for every backup. Application bundles are directories, so a
//! directory digest is defined over the whole tree: entries are visited in
//! sorted order and each contributes its relative path, its kind, and its
//! bytes (files) or target (symlinks). Two trees hash equal iff they have
//! the same shape and content.

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::UpdateError;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// A SHA-256 digest.
#[derive(Clone, Copy, Eq)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for Checksum {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| UpdateError::ConfigError(format!("invalid checksum: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UpdateError::ConfigError("checksum must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

/// Computes file and bundle digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Digest of a file, or of a directory tree.
    pub fn hash(&self, path: &Path) -> Result<Checksum, UpdateError> {
        let metadata = fs::symlink_metadata(path)?;
        let mut hasher = Sha256::new();

        if metadata.is_dir() {
            hash_tree(&mut hasher, path, Path::new(""))?;
        } else {
            hash_file_contents(&mut hasher, path)?;
        }

        Ok(Checksum(hasher.finalize().into()))
    }

    /// Hash `path` and compare with `expected`.
    pub fn verify(&self, path: &Path, expected: &Checksum) -> Result<(), UpdateError> {
        let actual = self.hash(path)?;
        if actual != *expected {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                path = %path.display(),
                "Checksum mismatch"
            );
            return Err(UpdateError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        tracing::debug!(checksum = %actual, path = %path.display(), "Checksum verified");
        Ok(())
    }
}

/// Total size in bytes of a file or of every file under a directory.
pub fn tree_size(path: &Path) -> Result<u64, UpdateError> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

fn hash_file_contents(hasher: &mut Sha256, path: &Path) -> Result<(), UpdateError> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(())
}

fn hash_tree(hasher: &mut Sha256, root: &Path, relative: &Path) -> Result<(), UpdateError> {
    let dir = root.join(relative);
    let mut names: Vec<_> = fs::read_dir(&dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<Result<_, _>>()?;
    names.sort();

    for name in names {
        let rel = relative.join(&name);
        let full = root.join(&rel);
        let metadata = fs::symlink_metadata(&full)?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if metadata.file_type().is_symlink() {
            hasher.update(b"L\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            hasher.update(fs::read_link(&full)?.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if metadata.is_dir() {
            hasher.update(b"D\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            hash_tree(hasher, root, &rel)?;
        } else {
            hasher.update(b"F\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            hasher.update(metadata.len().to_le_bytes());
            hash_file_contents(hasher, &full)?;
        }
    }
    Ok(())
}
