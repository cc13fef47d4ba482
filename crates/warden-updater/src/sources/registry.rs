//! Package-manager (Homebrew) source.
//!
//! One `brew outdated --json=v2 --greedy` call answers for every
//! package-managed application. Upgrades of those applications are also
//! delegated to the package manager rather than the atomic installer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::BatchUpdateSource;
use crate::error::UpdateError;
use crate::executor::SafeExecutor;
use crate::model::{InstalledApplication, SourceKind, UpdateCandidate};
use crate::version;

const BREW: &str = "brew";

/// `brew outdated --json=v2` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutdatedReport {
    #[serde(default)]
    pub formulae: Vec<OutdatedPackage>,
    #[serde(default)]
    pub casks: Vec<OutdatedPackage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutdatedPackage {
    pub name: String,
    #[serde(default)]
    pub installed_versions: InstalledVersions,
    pub current_version: String,
}

/// Casks and formulae have reported installed versions both as a string
/// and as a list across releases.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstalledVersions {
    One(String),
    Many(Vec<String>),
}

impl Default for InstalledVersions {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OutdatedReport {
    pub fn packages(&self) -> impl Iterator<Item = &OutdatedPackage> {
        self.casks.iter().chain(self.formulae.iter())
    }
}

/// Parse the outdated listing.
pub fn parse_outdated(json: &str) -> Result<OutdatedReport, UpdateError> {
    Ok(serde_json::from_str(json)?)
}

/// Whether `package` names `app`.
///
/// Names match by case-insensitive containment in either direction, against
/// the package token and the display name; the identifier matches when it
/// contains the package name.
pub fn package_matches(package: &OutdatedPackage, app: &InstalledApplication) -> bool {
    let pkg = package.name.trim().to_lowercase();
    if pkg.is_empty() {
        return false;
    }

    let names = [app.package_name.as_deref(), Some(app.name.as_str())];
    let by_name = names
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .any(|name| name.contains(&pkg) || pkg.contains(&name));

    by_name || app.identifier.to_lowercase().contains(&pkg)
}

/// Pair each managed application with its outdated entry.
pub fn match_outdated(report: &OutdatedReport, apps: &[InstalledApplication]) -> Vec<UpdateCandidate> {
    apps.iter()
        .filter(|app| app.is_package_managed())
        .filter_map(|app| {
            let package = report.packages().find(|p| package_matches(p, app))?;
            if !version::is_newer(&package.current_version, &app.version) {
                debug!(app = %app.identifier, package = %package.name, "Registry version is not newer");
                return None;
            }
            Some(UpdateCandidate::new(
                app.clone(),
                package.current_version.clone(),
                String::new(),
                SourceKind::PackageRegistry,
            ))
        })
        .collect()
}

/// Homebrew client.
#[derive(Debug, Clone)]
pub struct PackageRegistryClient {
    executor: Arc<SafeExecutor>,
    timeout: Duration,
}

impl PackageRegistryClient {
    pub fn new(executor: Arc<SafeExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Upgrade one cask in place.
    pub async fn upgrade(&self, token: &str, timeout: Duration) -> Result<(), UpdateError> {
        info!(token, "Upgrading through package manager");
        let output = self
            .executor
            .execute(BREW, &["upgrade", "--cask", token], timeout, None)
            .await?;
        if !output.success() {
            return Err(UpdateError::PackageManagerFailed(format!(
                "brew upgrade --cask {token} exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchUpdateSource for PackageRegistryClient {
    fn kind(&self) -> SourceKind {
        SourceKind::PackageRegistry
    }

    async fn fetch_batch(&self, apps: &[InstalledApplication]) -> Vec<UpdateCandidate> {
        if !apps.iter().any(InstalledApplication::is_package_managed) {
            return Vec::new();
        }

        let output = match self
            .executor
            .execute(BREW, &["outdated", "--json=v2", "--greedy"], self.timeout, None)
            .await
            .and_then(|out| out.into_result(BREW))
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Package manager query failed");
                return Vec::new();
            }
        };

        match parse_outdated(&output.stdout) {
            Ok(report) => match_outdated(&report, apps),
            Err(e) => {
                warn!(error = %e, "Unparseable package manager output");
                Vec::new()
            }
        }
    }
}
