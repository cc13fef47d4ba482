//! Warden CLI - keep locally installed applications up to date
//!
//! This crate provides a command-line interface for:
//! - Checking every inventoried application for updates
//! - Installing updates with verified backups
//! - Listing, restoring and pruning backups
//! - Inspecting and refreshing the incompatibility rules

pub mod cli;
pub mod output;

pub use cli::Cli;
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

use warden_updater::UpdateError;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Verification failed (checksum, backup or code signature)
/// - 3: Timeout
/// - 4: Network or download failure
/// - 5: Invalid input or configuration
/// - 6: Insufficient disk space
/// - 7: Another install for the application is running
/// - 8: Rollback failed; the application may be inconsistent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    VerificationFailed = 2,
    Timeout = 3,
    NetworkFailed = 4,
    InvalidInput = 5,
    InsufficientSpace = 6,
    Busy = 7,
    RollbackFailed = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Exit code for a library error.
    pub fn from_update_error(error: &UpdateError) -> Self {
        match error {
            UpdateError::RollbackFailed(_) => Self::RollbackFailed,
            UpdateError::ChecksumMismatch { .. }
            | UpdateError::BackupVerificationFailed(_)
            | UpdateError::SignatureVerificationFailed(_)
            | UpdateError::BackupCorrupted => Self::VerificationFailed,
            UpdateError::Timeout { .. } => Self::Timeout,
            UpdateError::DownloadFailed { .. }
            | UpdateError::ResponseTooLarge { .. }
            | UpdateError::HttpError(_) => Self::NetworkFailed,
            UpdateError::InvalidArguments(_)
            | UpdateError::InvalidExecutable(_)
            | UpdateError::ConfigError(_)
            | UpdateError::NoDownload(_)
            | UpdateError::NoBackupAvailable(_)
            | UpdateError::UnsupportedArtifact(_) => Self::InvalidInput,
            UpdateError::InsufficientSpace { .. } => Self::InsufficientSpace,
            UpdateError::InstallInProgress(_) => Self::Busy,
            _ => Self::GeneralError,
        }
    }

    /// Exit code for any error reaching `main`.
    pub fn from_error(error: &anyhow::Error) -> Self {
        error
            .downcast_ref::<UpdateError>()
            .map(Self::from_update_error)
            .unwrap_or(Self::GeneralError)
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::VerificationFailed => "VERIFICATION_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::NetworkFailed => "NETWORK_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::InsufficientSpace => "INSUFFICIENT_SPACE",
            ExitCode::Busy => "BUSY",
            ExitCode::RollbackFailed => "ROLLBACK_FAILED",
        }
    }
}
