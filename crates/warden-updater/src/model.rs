//! Inventory and candidate records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an application was put on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Installed and upgraded by the package manager.
    PackageManager,
    /// Installed directly (drag-to-Applications, installer package, ...).
    #[default]
    Direct,
}

/// One application in a scanner snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApplication {
    /// Stable identifier, usually the reverse-domain bundle id
    pub identifier: String,
    /// Display name
    pub name: String,
    /// Installed version string
    pub version: String,
    /// Bundle location
    pub path: PathBuf,
    /// Appcast feed URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    /// Package-manager token (cask or formula name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    /// Source repository as `owner/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
    /// Bundle modification time as reported by the scanner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl InstalledApplication {
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            version: version.into(),
            path: path.into(),
            feed_url: None,
            package_name: None,
            repository: None,
            provenance: Provenance::Direct,
            last_modified: None,
        }
    }

    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = Some(url.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Mark as package-managed under `package_name`.
    pub fn with_package(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self.provenance = Provenance::PackageManager;
        self
    }

    pub fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    pub fn is_package_managed(&self) -> bool {
        self.provenance == Provenance::PackageManager
    }
}

/// Which client produced a candidate.
///
/// Declaration order is dedup priority: earlier wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Sparkle,
    PackageRegistry,
    ReleaseApi,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sparkle => write!(f, "sparkle"),
            Self::PackageRegistry => write!(f, "registry"),
            Self::ReleaseApi => write!(f, "release-api"),
        }
    }
}

/// A detected update for one application from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    pub application: InstalledApplication,
    /// Version offered by the source
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    /// Download URL; empty when the package manager performs the install
    #[serde(default)]
    pub download_url: String,
    pub is_security: bool,
    pub is_compatible: bool,
    /// Short human summary of the changelog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub source: SourceKind,
}

impl UpdateCandidate {
    pub fn new(
        application: InstalledApplication,
        version: impl Into<String>,
        download_url: impl Into<String>,
        source: SourceKind,
    ) -> Self {
        Self {
            application,
            version: version.into(),
            changelog: None,
            download_url: download_url.into(),
            is_security: false,
            is_compatible: true,
            summary: None,
            detected_at: Utc::now(),
            source,
        }
    }

    /// Attach changelog text and classify it for security keywords.
    pub fn with_changelog(mut self, changelog: impl Into<String>) -> Self {
        let changelog = changelog.into();
        self.is_security = is_security_text(&changelog);
        self.changelog = Some(changelog);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.application.identifier
    }

    /// Whether the candidate is strictly newer than what is installed.
    pub fn is_upgrade(&self) -> bool {
        crate::version::is_newer(&self.version, &self.application.version)
    }
}

/// Keywords that flag a changelog as security-relevant.
pub const SECURITY_KEYWORDS: &[&str] = &[
    "security",
    "vulnerability",
    "cve",
    "exploit",
    "patch",
    "fix",
];

/// Case-insensitive keyword check used by every source client.
pub fn is_security_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    SECURITY_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}
