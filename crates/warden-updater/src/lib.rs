//! # warden-updater
//!
//! Update reconciliation and safe installation for locally installed
//! applications.
//!
//! This crate handles:
//! - Concurrent update detection across appcast feeds, the package manager
//!   and release APIs, deduplicated to one candidate per application
//! - Compatibility filtering against a bundled incompatibility registry
//! - Download, disk image / archive / installer package handling and code
//!   signature verification
//! - Atomic bundle replacement with verified backups and rollback
//!
//! ## Safety
//!
//! - Every external tool runs through an allow-listed executor with timeouts
//! - Nothing under the destination changes until the staged copy and the
//!   backup both verify
//! - A failed post-install check restores the backup

pub mod artifact;
pub mod background;
pub mod checksum;
pub mod config;
pub mod download;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod fs_utils;
pub mod install;
pub mod model;
pub mod orchestrator;
#[cfg(test)]
mod proptests;
pub mod reconcile;
pub mod rollback;
pub mod rules;
pub mod scanner;
pub mod signature;
pub mod sources;
pub mod status;
pub mod summary;
pub mod version;

// Re-export main types for convenience
pub use artifact::{ArtifactFormat, ArtifactHandler, ResolvedArtifact};
pub use background::{select_background_candidates, Deferral, EnvironmentProbe, StaticEnvironment, TriggerGate};
pub use checksum::{Checksum, ChecksumVerifier};
pub use config::{UpdateConfig, default_config_path, default_data_dir};
pub use download::{DownloadProgress, Downloader};
pub use eligibility::{EligibilityFilter, UpdatePolicy, Verdict};
pub use error::{Severity, UpdateError};
pub use executor::{ExecOutput, SafeExecutor};
pub use install::{AtomicInstaller, CancelToken, InstallReport, InstallRequest, InstallState};
pub use model::{InstalledApplication, Provenance, SourceKind, UpdateCandidate};
pub use orchestrator::{BackgroundRun, CheckReport, InstallMethod, InstallOrchestrator, InstallOutcome};
pub use reconcile::UpdateReconciler;
pub use rollback::{BackupRecord, RollbackStore};
pub use rules::{IncompatibilityRule, RuleRegistry, RuleSeverity};
pub use scanner::{JsonInventoryScanner, Scanner, StaticScanner};
pub use signature::{CodeSignatureVerifier, CodesignVerifier};
pub use sources::{BatchUpdateSource, PackageRegistryClient, ReleaseApiClient, SparkleFeedClient, UpdateSource};
pub use status::{FleetStatus, StatusCoordinator, StatusEvent, StatusReporter};
pub use summary::{ChangelogSummarizer, FirstSentenceSummarizer};
