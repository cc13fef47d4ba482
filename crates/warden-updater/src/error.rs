//! Error types for the update system.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during reconciliation and installation.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Tool name is not on the allow-list or its executable is missing
    #[error("invalid executable: {0}")]
    InvalidExecutable(String),

    /// An argument contained a shell metacharacter sequence
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Subprocess or network call exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Subprocess exited unsuccessfully
    #[error("{tool} exited with status {status:?}: {stderr}")]
    CommandFailed {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Staged, source or destination digests disagree
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The backup taken before the swap does not match the original
    #[error("backup verification failed: {0}")]
    BackupVerificationFailed(String),

    /// Not enough free space on the destination volume
    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    /// Code signature verification failed on the resolved bundle
    #[error("code signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// Archive extraction failed or produced no application bundle
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Disk image could not be attached or contained no bundle
    #[error("disk image mount failed: {0}")]
    MountFailed(String),

    /// Installation failed
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Package manager upgrade failed
    #[error("package manager failed: {0}")]
    PackageManagerFailed(String),

    /// Rollback failed after a destination mutation
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Backup is corrupted or missing
    #[error("backup corrupted or missing")]
    BackupCorrupted,

    /// No backup available for rollback
    #[error("no backup available for {0}")]
    NoBackupAvailable(String),

    /// Another install for the same application is in flight
    #[error("an install for {0} is already in progress")]
    InstallInProgress(String),

    /// Operation was cancelled between installer transitions
    #[error("operation cancelled")]
    Cancelled,

    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Response body is larger than the configured cap
    #[error("response exceeds the {limit} byte limit")]
    ResponseTooLarge { limit: u64 },

    /// Candidate carries no download locator
    #[error("no download available for {0}")]
    NoDownload(String),

    /// Unsupported artifact format
    #[error("unsupported artifact: {0}")]
    UnsupportedArtifact(String),

    /// Feed or API document could not be parsed
    #[error("feed parse error: {0}")]
    FeedParse(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

/// Failure class used by callers to pick a remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Skip this source or application for the current cycle.
    Transient,
    /// The specific install aborted; original state is preserved.
    Integrity,
    /// Aborted before any destructive step; the caller can fix the environment.
    Resource,
    /// The installed application may be inconsistent.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Integrity => write!(f, "integrity"),
            Self::Resource => write!(f, "resource"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

impl UpdateError {
    /// Classify the error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::RollbackFailed(_) => Severity::Fatal,
            Self::ChecksumMismatch { .. }
            | Self::BackupVerificationFailed(_)
            | Self::SignatureVerificationFailed(_)
            | Self::BackupCorrupted => Severity::Integrity,
            Self::InsufficientSpace { .. }
            | Self::InvalidExecutable(_)
            | Self::InvalidArguments(_)
            | Self::ConfigError(_)
            | Self::UnsupportedArtifact(_)
            | Self::NoDownload(_)
            | Self::NoBackupAvailable(_) => Severity::Resource,
            Self::Timeout { .. }
            | Self::CommandFailed { .. }
            | Self::ExtractionFailed(_)
            | Self::MountFailed(_)
            | Self::InstallationFailed(_)
            | Self::PackageManagerFailed(_)
            | Self::InstallInProgress(_)
            | Self::Cancelled
            | Self::DownloadFailed { .. }
            | Self::ResponseTooLarge { .. }
            | Self::FeedParse(_)
            | Self::JsonError(_)
            | Self::IoError(_)
            | Self::HttpError(_) => Severity::Transient,
        }
    }

    /// Whether the installed application may have been left inconsistent.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
