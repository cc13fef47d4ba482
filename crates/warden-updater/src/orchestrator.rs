//! End-to-end update pipeline.
//!
//! [`InstallOrchestrator`] ties the pieces together:
//!
//! ```text
//! scan -> reconcile -> filter -> admit -> (brew | download -> resolve ->
//!     signature -> atomic install) -> retention
//! ```
//!
//! Only one install per application identifier runs at a time; a second
//! request while the first is in flight is refused with
//! [`UpdateError::InstallInProgress`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactHandler, ResolvedArtifact};
use crate::checksum::ChecksumVerifier;
use crate::background::{select_background_candidates, Deferral, EnvironmentProbe, TriggerGate};
use crate::config::UpdateConfig;
use crate::download::Downloader;
use crate::eligibility::{EligibilityFilter, UpdatePolicy};
use crate::error::UpdateError;
use crate::executor::SafeExecutor;
use crate::fs_utils::path_exists;
use crate::install::{
    blocking, take_rollback_point, AtomicInstaller, CancelToken, InstallRequest, InstallState, QuarantineRelease,
    SpaceProbe, TransitionObserver,
};
use crate::model::{InstalledApplication, UpdateCandidate};
use crate::reconcile::UpdateReconciler;
use crate::rollback::{BackupRecord, RollbackStore};
use crate::rules::RuleRegistry;
use crate::scanner::{dedup_inventory, Scanner};
use crate::signature::{CodeSignatureVerifier, CodesignVerifier};
use crate::sources::{PackageRegistryClient, ReleaseApiClient, SparkleFeedClient};
use crate::status::{StatusEvent, StatusReporter};
use crate::summary::FirstSentenceSummarizer;

/// How an update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    PackageManager,
    InstallerPackage,
    Bundle,
}

/// Result of a successful install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub identifier: String,
    pub version: String,
    pub method: InstallMethod,
    /// Backup of the version that was replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
}

/// Inventory and the eligible candidates found for it.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub applications: Vec<InstalledApplication>,
    pub candidates: Vec<UpdateCandidate>,
}

/// What a background trigger did.
#[derive(Debug)]
pub enum BackgroundRun {
    Deferred(Deferral),
    Completed(Vec<(String, Result<InstallOutcome, UpdateError>)>),
}

/// Holds an identifier's admission slot until dropped.
#[derive(Debug)]
pub struct AdmissionGuard {
    slots: Arc<Mutex<HashSet<String>>>,
    identifier: String,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.identifier);
    }
}

/// Drives checks and installs for an inventory.
pub struct InstallOrchestrator {
    scanner: Arc<dyn Scanner>,
    reconciler: UpdateReconciler,
    filter: EligibilityFilter,
    rules: Arc<RuleRegistry>,
    rules_url: Option<String>,
    policy: UpdatePolicy,
    downloader: Downloader,
    artifacts: ArtifactHandler,
    registry: Option<PackageRegistryClient>,
    signature: Option<Arc<dyn CodeSignatureVerifier>>,
    installer: AtomicInstaller,
    store: Arc<RollbackStore>,
    work_root: PathBuf,
    package_timeout: Duration,
    slots: Arc<Mutex<HashSet<String>>>,
    status: StatusReporter,
}

impl fmt::Debug for InstallOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallOrchestrator")
            .field("rules", &self.rules.len())
            .field("policy", &self.policy)
            .field("package_manager", &self.registry.is_some())
            .field("signature", &self.signature.as_ref().map(|s| s.description().to_string()))
            .field("installer", &self.installer)
            .field("work_root", &self.work_root)
            .finish()
    }
}

fn transition_observer(reporter: StatusReporter) -> TransitionObserver {
    Arc::new(move |identifier: &str, state: InstallState| {
        reporter.report(StatusEvent::InstallTransition {
            identifier: identifier.to_string(),
            state,
        })
    })
}

impl InstallOrchestrator {
    /// Build the full pipeline from configuration using the system tools.
    pub fn from_config(config: &UpdateConfig, scanner: Arc<dyn Scanner>) -> Result<Self, UpdateError> {
        Self::from_config_with_executor(config, scanner, Arc::new(SafeExecutor::with_system_tools()))
    }

    /// Build the full pipeline with an explicit tool allow-list.
    pub fn from_config_with_executor(
        config: &UpdateConfig,
        scanner: Arc<dyn Scanner>,
        executor: Arc<SafeExecutor>,
    ) -> Result<Self, UpdateError> {
        let downloader = Downloader::new(&config.network)?;
        let tool_timeout = config.install.tool_timeout();

        let mut reconciler = UpdateReconciler::new(config.network.timeout())
            .with_max_concurrent(config.network.max_concurrent_queries)
            .with_source(Arc::new(SparkleFeedClient::new(downloader.clone())))
            .with_source(Arc::new(ReleaseApiClient::new(
                downloader.clone(),
                config.sources.github_api_url.clone(),
                config.sources.resolved_github_token(),
            )))
            .with_summarizer(
                Arc::new(FirstSentenceSummarizer),
                Duration::from_secs(config.sources.summary_timeout_seconds),
            );

        let registry = config.sources.package_manager.then(|| {
            PackageRegistryClient::new(
                Arc::clone(&executor),
                Duration::from_secs(config.sources.registry_timeout_seconds),
            )
        });
        if let Some(registry) = &registry {
            reconciler = reconciler.with_batch_source(
                Arc::new(registry.clone()),
                Duration::from_secs(config.sources.registry_timeout_seconds),
            );
        }

        let rules = Arc::new(RuleRegistry::bundled()?);
        let store = Arc::new(RollbackStore::new(
            config.rollback.backup_dir(),
            config.rollback.max_backups,
        ));
        let work_root = config.install.staging_dir();

        let mut installer = AtomicInstaller::new(Arc::clone(&store), work_root.clone());
        if config.security.release_quarantine {
            installer = installer.with_post_swap(Arc::new(QuarantineRelease::new(Arc::clone(&executor), tool_timeout)));
        }

        let signature: Option<Arc<dyn CodeSignatureVerifier>> = if config.security.verify_code_signature {
            Some(Arc::new(CodesignVerifier::from_config(
                Arc::clone(&executor),
                tool_timeout,
                &config.security,
            )))
        } else {
            None
        };

        Ok(Self {
            scanner,
            reconciler,
            filter: EligibilityFilter::new(Arc::clone(&rules)),
            rules,
            rules_url: config.rules.remote_url.clone(),
            policy: config.policy.to_policy(),
            downloader,
            artifacts: ArtifactHandler::new(executor, tool_timeout),
            registry,
            signature,
            installer,
            store,
            work_root,
            package_timeout: config.install.package_timeout(),
            slots: Arc::new(Mutex::new(HashSet::new())),
            status: StatusReporter::disabled(),
        })
    }

    /// Report progress to a status coordinator.
    pub fn with_status(mut self, reporter: StatusReporter) -> Self {
        self.installer = self.installer.with_observer(transition_observer(reporter.clone()));
        self.status = reporter;
        self
    }

    /// Replace the code signature verifier.
    pub fn with_signature_verifier(mut self, verifier: Arc<dyn CodeSignatureVerifier>) -> Self {
        self.signature = Some(verifier);
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.installer = self.installer.with_space_probe(probe);
        self
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<RollbackStore> {
        &self.store
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    /// Refresh incompatibility rules from the configured remote document.
    ///
    /// Returns `Ok(None)` when no remote is configured. The current list is
    /// kept on any failure.
    pub async fn refresh_rules(&self) -> Result<Option<usize>, UpdateError> {
        match &self.rules_url {
            Some(url) => self.rules.refresh(&self.downloader, url).await.map(Some),
            None => Ok(None),
        }
    }

    /// Scan, reconcile and filter.
    pub async fn check(&self) -> Result<CheckReport, UpdateError> {
        self.status.report(StatusEvent::ScanStarted);
        let applications = match self.scanner.scan().await {
            Ok(apps) => dedup_inventory(apps),
            Err(e) => {
                self.status.report(StatusEvent::ScanFinished { applications: 0 });
                return Err(e);
            }
        };
        self.status.report(StatusEvent::ScanFinished {
            applications: applications.len(),
        });

        self.status.report(StatusEvent::CheckStarted);
        let found = self.reconciler.reconcile(&applications).await;
        let candidates = self.filter.apply(found, &self.policy);
        self.status.report(StatusEvent::CheckFinished {
            updates: candidates.len(),
        });

        Ok(CheckReport {
            applications,
            candidates,
        })
    }

    /// Claim the install slot for `identifier`.
    pub fn admit(&self, identifier: &str) -> Result<AdmissionGuard, UpdateError> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !slots.insert(identifier.to_string()) {
            return Err(UpdateError::InstallInProgress(identifier.to_string()));
        }
        Ok(AdmissionGuard {
            slots: Arc::clone(&self.slots),
            identifier: identifier.to_string(),
        })
    }

    /// Install one candidate.
    pub async fn install(
        &self,
        candidate: &UpdateCandidate,
        cancel: &CancelToken,
    ) -> Result<InstallOutcome, UpdateError> {
        let id = candidate.identifier().to_string();
        let _slot = self.admit(&id)?;

        info!(app = %id, version = %candidate.version, source = %candidate.source, "Installing update");
        self.status.report(StatusEvent::InstallQueued {
            identifier: id.clone(),
            version: candidate.version.clone(),
        });

        let result = self.install_admitted(candidate, cancel).await;
        match &result {
            Ok(outcome) => {
                if let Err(e) = self.apply_retention(&id).await {
                    warn!(app = %id, error = %e, "Backup retention failed");
                }
                info!(app = %id, version = %outcome.version, method = ?outcome.method, "Update installed");
                self.status.report(StatusEvent::InstallSucceeded {
                    identifier: id,
                    version: outcome.version.clone(),
                });
            }
            Err(e) => {
                warn!(app = %id, error = %e, severity = %e.severity(), "Update failed");
                self.status.report(StatusEvent::InstallFailed {
                    identifier: id,
                    error: e.to_string(),
                    fatal: e.is_fatal(),
                });
            }
        }
        result
    }

    async fn install_admitted(
        &self,
        candidate: &UpdateCandidate,
        cancel: &CancelToken,
    ) -> Result<InstallOutcome, UpdateError> {
        let app = &candidate.application;

        if app.is_package_managed() {
            if let (Some(registry), Some(token)) = (&self.registry, app.package_name.as_deref()) {
                cancel.check()?;
                registry.upgrade(token, self.package_timeout).await?;
                return Ok(InstallOutcome {
                    identifier: app.identifier.clone(),
                    version: candidate.version.clone(),
                    method: InstallMethod::PackageManager,
                    backup: None,
                });
            }
        }

        if candidate.download_url.trim().is_empty() {
            return Err(UpdateError::NoDownload(app.identifier.clone()));
        }

        tokio::fs::create_dir_all(&self.work_root).await?;
        // Downloads and extraction output are removed when this drops.
        let work = tempfile::Builder::new()
            .prefix("download-")
            .tempdir_in(&self.work_root)?;

        let artifact = self
            .progress_downloader(&app.identifier)
            .download_to_dir(&candidate.download_url, work.path())
            .await?;
        cancel.check()?;

        let resolved = self.artifacts.resolve(&artifact, work.path()).await?;
        let result = match &resolved {
            ResolvedArtifact::Package(package) => self.install_package(candidate, package).await,
            ResolvedArtifact::Bundle(bundle) | ResolvedArtifact::Mounted { bundle, .. } => {
                self.install_bundle(candidate, bundle, cancel).await
            }
        };
        self.artifacts.release(&resolved).await;
        result
    }

    fn progress_downloader(&self, identifier: &str) -> Downloader {
        let reporter = self.status.clone();
        let identifier = identifier.to_string();
        self.downloader.clone().with_progress(move |progress| {
            reporter.report(StatusEvent::Downloading {
                identifier: identifier.clone(),
                downloaded: progress.downloaded,
                total: progress.total,
            })
        })
    }

    async fn install_bundle(
        &self,
        candidate: &UpdateCandidate,
        bundle: &Path,
        cancel: &CancelToken,
    ) -> Result<InstallOutcome, UpdateError> {
        let app = &candidate.application;

        if let Some(verifier) = &self.signature {
            debug!(app = %app.identifier, verifier = verifier.description(), "Checking code signature");
            verifier.verify(bundle).await?;
        }

        let report = self
            .installer
            .run(
                InstallRequest {
                    identifier: app.identifier.clone(),
                    installed_version: app.version.clone(),
                    source: bundle.to_path_buf(),
                    destination: app.path.clone(),
                },
                cancel,
            )
            .await?;

        Ok(InstallOutcome {
            identifier: app.identifier.clone(),
            version: candidate.version.clone(),
            method: InstallMethod::Bundle,
            backup: report.backup,
        })
    }

    /// Run an installer package with a rollback point taken first; a failed
    /// package install restores it.
    async fn install_package(
        &self,
        candidate: &UpdateCandidate,
        package: &Path,
    ) -> Result<InstallOutcome, UpdateError> {
        let app = &candidate.application;

        let backup = if path_exists(&app.path) {
            let store = Arc::clone(&self.store);
            let (id, version, path) = (app.identifier.clone(), app.version.clone(), app.path.clone());
            let record = blocking(move || {
                take_rollback_point(&store, &ChecksumVerifier::new(), &id, &version, &path)
            })
            .await?;
            Some(record)
        } else {
            None
        };

        if let Err(e) = self.artifacts.install_package(package, self.package_timeout).await {
            if let Some(record) = backup {
                warn!(app = %app.identifier, error = %e, "Installer package failed, restoring previous version");
                let store = Arc::clone(&self.store);
                let dest = app.path.clone();
                blocking(move || store.restore(&record, &dest))
                    .await
                    .map_err(|restore| match restore {
                        UpdateError::RollbackFailed(_) => restore,
                        other => UpdateError::RollbackFailed(other.to_string()),
                    })?;
            }
            return Err(e);
        }

        Ok(InstallOutcome {
            identifier: app.identifier.clone(),
            version: candidate.version.clone(),
            method: InstallMethod::InstallerPackage,
            backup,
        })
    }

    async fn apply_retention(&self, identifier: &str) -> Result<usize, UpdateError> {
        let store = Arc::clone(&self.store);
        let identifier = identifier.to_string();
        blocking(move || store.apply_retention(&identifier)).await
    }

    /// Restore a backup of `app`, newest unless `version` is given.
    ///
    /// The version being replaced is backed up first so the rollback can
    /// itself be undone; the restored record is consumed.
    pub async fn rollback(
        &self,
        app: &InstalledApplication,
        version: Option<&str>,
    ) -> Result<BackupRecord, UpdateError> {
        let _slot = self.admit(&app.identifier)?;
        let store = Arc::clone(&self.store);
        let app = app.clone();
        let version = version.map(str::to_string);

        blocking(move || {
            let record = match &version {
                Some(v) => store.find(&app.identifier, v)?,
                None => store.latest(&app.identifier)?,
            }
            .ok_or_else(|| UpdateError::NoBackupAvailable(app.identifier.clone()))?;

            if path_exists(&app.path) && app.version != record.version {
                store.create_backup(&app.identifier, &app.version, &app.path)?;
            }
            store.consume(&record, &app.path)?;
            store.apply_retention(&app.identifier)?;
            info!(app = %app.identifier, version = %record.version, "Rolled back");
            Ok(record)
        })
        .await
    }

    /// Gate, check, then install every eligible background candidate.
    pub async fn run_background(
        &self,
        gate: &TriggerGate,
        probe: &dyn EnvironmentProbe,
        cancel: &CancelToken,
    ) -> Result<BackgroundRun, UpdateError> {
        if let Err(deferral) = gate.check(probe) {
            info!(?deferral, "Background run deferred");
            return Ok(BackgroundRun::Deferred(deferral));
        }

        let report = self.check().await?;
        let selected = select_background_candidates(&report.candidates, &self.policy);

        let results = join_all(selected.iter().map(|candidate| async move {
            (candidate.identifier().to_string(), self.install(candidate, cancel).await)
        }))
        .await;
        Ok(BackgroundRun::Completed(results))
    }
}
