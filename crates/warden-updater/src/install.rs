//! Atomic bundle installation.
//!
//! [`AtomicInstaller`] replaces an application bundle through a fixed
//! sequence of states:
//!
//! ```text
//! Idle -> Staged -> BackedUp -> Verified -> Swapped -> Confirmed
//!                                              |
//!                                              +-> RolledBack | Failed
//! ```
//!
//! Nothing under the destination changes before `Swapped`. Every failure up
//! to the swap leaves the installed bundle as it was; a failed post-swap
//! check restores the backup. Staging is always removed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checksum::{tree_size, Checksum, ChecksumVerifier};
use crate::error::UpdateError;
use crate::executor::SafeExecutor;
use crate::fs_utils::{copy_tree, move_path, path_exists, remove_path};
use crate::rollback::{aside_path, BackupRecord, RollbackStore};

/// Free space required on the destination volume, as a multiple of the
/// artifact size.
pub const SPACE_FACTOR: u64 = 2;

/// Installer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Idle,
    Staged,
    BackedUp,
    Verified,
    Swapped,
    Confirmed,
    RolledBack,
    Failed,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Staged => "staged",
            Self::BackedUp => "backed-up",
            Self::Verified => "verified",
            Self::Swapped => "swapped",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation flag, honored between installer transitions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Reports free bytes on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> Result<u64, UpdateError>;
}

/// [`SpaceProbe`] backed by `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_space(&self, path: &Path) -> Result<u64, UpdateError> {
        let mut probe = path;
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        statvfs_available(probe)
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn statvfs_available(path: &Path) -> Result<u64, UpdateError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| UpdateError::InvalidArguments(format!("{} contains NUL", path.display())))?;
    // SAFETY: statvfs is plain old data, fully written by a successful call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and outlives the call.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn statvfs_available(_path: &Path) -> Result<u64, UpdateError> {
    Ok(u64::MAX)
}

/// Step run right after the swap, before the final checksum.
#[async_trait]
pub trait PostSwapAction: Send + Sync {
    async fn after_swap(&self, destination: &Path) -> Result<(), UpdateError>;
}

/// Clears the quarantine attribute on the installed bundle.
#[derive(Debug, Clone)]
pub struct QuarantineRelease {
    executor: Arc<SafeExecutor>,
    timeout: Duration,
}

impl QuarantineRelease {
    pub fn new(executor: Arc<SafeExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

#[async_trait]
impl PostSwapAction for QuarantineRelease {
    async fn after_swap(&self, destination: &Path) -> Result<(), UpdateError> {
        let path = destination.to_string_lossy();
        let output = self
            .executor
            .execute("xattr", &["-d", "-r", "com.apple.quarantine", &*path], self.timeout, None)
            .await?;
        // xattr exits non-zero when the attribute was never set
        if !output.success() {
            debug!(path = %path, stderr = %output.stderr.trim(), "Quarantine attribute not removed");
        }
        Ok(())
    }
}

/// One bundle replacement.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub identifier: String,
    /// Version currently at `destination`, recorded on the backup
    pub installed_version: String,
    /// Resolved bundle to install
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Outcome of a confirmed install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub identifier: String,
    pub destination: PathBuf,
    pub checksum: Checksum,
    pub backup: Option<BackupRecord>,
    pub state: InstallState,
}

/// Callback observing every state entered.
pub type TransitionObserver = Arc<dyn Fn(&str, InstallState) + Send + Sync>;

/// Runs the install state machine.
#[derive(Clone)]
pub struct AtomicInstaller {
    store: Arc<RollbackStore>,
    staging_root: PathBuf,
    verifier: ChecksumVerifier,
    space: Arc<dyn SpaceProbe>,
    post_swap: Option<Arc<dyn PostSwapAction>>,
    observer: Option<TransitionObserver>,
}

impl fmt::Debug for AtomicInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicInstaller")
            .field("store", &self.store.backup_dir())
            .field("staging_root", &self.staging_root)
            .field("post_swap", &self.post_swap.is_some())
            .finish()
    }
}

impl AtomicInstaller {
    pub fn new(store: Arc<RollbackStore>, staging_root: PathBuf) -> Self {
        Self {
            store,
            staging_root,
            verifier: ChecksumVerifier::new(),
            space: Arc::new(StatvfsProbe),
            post_swap: None,
            observer: None,
        }
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn with_post_swap(mut self, action: Arc<dyn PostSwapAction>) -> Self {
        self.post_swap = Some(action);
        self
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<RollbackStore> {
        &self.store
    }

    fn enter(&self, identifier: &str, state: InstallState) {
        debug!(app = identifier, %state, "Installer transition");
        if let Some(observer) = &self.observer {
            observer(identifier, state);
        }
    }

    /// Replace `request.destination` with `request.source`.
    ///
    /// `cancel` is consulted before each transition up to the swap. A
    /// post-swap checksum failure that is rolled back returns
    /// `ChecksumMismatch`; one that cannot be rolled back returns
    /// `RollbackFailed`.
    pub async fn run(&self, request: InstallRequest, cancel: &CancelToken) -> Result<InstallReport, UpdateError> {
        let id = request.identifier.clone();
        info!(
            app = %id,
            source = %request.source.display(),
            dest = %request.destination.display(),
            "Starting atomic install"
        );
        self.enter(&id, InstallState::Idle);

        let mut rolled_back = false;
        let result = self.drive(&request, cancel, &mut rolled_back).await;
        if let Err(e) = &result {
            if !rolled_back {
                self.enter(&id, InstallState::Failed);
            }
            error!(app = %id, error = %e, rolled_back, "Install did not complete");
        }
        result
    }

    async fn drive(
        &self,
        request: &InstallRequest,
        cancel: &CancelToken,
        rolled_back: &mut bool,
    ) -> Result<InstallReport, UpdateError> {
        let id = request.identifier.as_str();
        let verifier = self.verifier;

        std::fs::create_dir_all(&self.staging_root)?;
        // Removed on drop whatever the outcome.
        let staging = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&self.staging_root)?;
        let staged = staging.path().join(bundle_name(&request.source));

        // Idle -> Staged
        cancel.check()?;
        let source_hash = {
            let source = request.source.clone();
            let staged = staged.clone();
            blocking(move || {
                copy_tree(&source, &staged)?;
                verifier.hash(&source)
            })
            .await?
        };
        self.enter(id, InstallState::Staged);

        // Staged -> BackedUp
        cancel.check()?;
        let backup = if path_exists(&request.destination) {
            let store = Arc::clone(&self.store);
            let identifier = request.identifier.clone();
            let version = request.installed_version.clone();
            let dest = request.destination.clone();
            let record =
                blocking(move || take_rollback_point(&store, &verifier, &identifier, &version, &dest)).await?;
            Some(record)
        } else {
            debug!(app = id, "No installed bundle, nothing to back up");
            None
        };
        self.enter(id, InstallState::BackedUp);

        // BackedUp -> Verified
        cancel.check()?;
        {
            let staged = staged.clone();
            blocking(move || verifier.verify(&staged, &source_hash)).await?;
        }
        self.enter(id, InstallState::Verified);

        // Preflight
        {
            let source = request.source.clone();
            let size = blocking(move || tree_size(&source)).await?;
            let required = size.saturating_mul(SPACE_FACTOR);
            let available = self.space.available_space(&request.destination)?;
            if available < required {
                warn!(app = id, required, available, "Not enough free space");
                return Err(UpdateError::InsufficientSpace { required, available });
            }
        }

        // Verified -> Swapped
        cancel.check()?;
        {
            let staged = staged.clone();
            let dest = request.destination.clone();
            blocking(move || swap(&staged, &dest)).await?;
        }
        self.enter(id, InstallState::Swapped);

        // Swapped -> Confirmed
        if let Some(action) = &self.post_swap {
            if let Err(e) = action.after_swap(&request.destination).await {
                warn!(app = id, error = %e, "Post-swap action failed");
            }
        }

        let dest = request.destination.clone();
        let confirmed = blocking(move || verifier.verify(&dest, &source_hash)).await;
        match confirmed {
            Ok(()) => {
                self.enter(id, InstallState::Confirmed);
                info!(app = id, checksum = %source_hash, "Install confirmed");
                Ok(InstallReport {
                    identifier: request.identifier.clone(),
                    destination: request.destination.clone(),
                    checksum: source_hash,
                    backup,
                    state: InstallState::Confirmed,
                })
            }
            Err(mismatch) => {
                warn!(app = id, error = %mismatch, "Installed bundle failed verification, rolling back");
                self.roll_back(request, backup).await?;
                *rolled_back = true;
                self.enter(id, InstallState::RolledBack);
                Err(mismatch)
            }
        }
    }

    async fn roll_back(&self, request: &InstallRequest, backup: Option<BackupRecord>) -> Result<(), UpdateError> {
        let store = Arc::clone(&self.store);
        let dest = request.destination.clone();
        blocking(move || match backup {
            Some(record) => store.restore(&record, &dest).map_err(|e| match e {
                UpdateError::RollbackFailed(_) => e,
                other => UpdateError::RollbackFailed(other.to_string()),
            }),
            None => remove_path(&dest).map_err(|e| UpdateError::RollbackFailed(e.to_string())),
        })
        .await
    }
}

/// Back up `original` and check the copy against it.
pub(crate) fn take_rollback_point(
    store: &RollbackStore,
    verifier: &ChecksumVerifier,
    identifier: &str,
    version: &str,
    original: &Path,
) -> Result<BackupRecord, UpdateError> {
    let record = store.create_backup(identifier, version, original)?;
    confirm_backup(store, verifier, &record, original)?;
    Ok(record)
}

/// Compare a fresh backup against the bundle it was taken from, discarding
/// it on mismatch.
fn confirm_backup(
    store: &RollbackStore,
    verifier: &ChecksumVerifier,
    record: &BackupRecord,
    original: &Path,
) -> Result<(), UpdateError> {
    let fresh = verifier.hash(original)?;
    let recorded = record.checksum()?;
    if recorded != fresh {
        if let Err(e) = store.discard(record) {
            warn!(error = %e, "Failed to discard unverified backup");
        }
        return Err(UpdateError::BackupVerificationFailed(format!(
            "backup of {} hashes to {recorded}, original hashes to {fresh}",
            record.identifier
        )));
    }
    Ok(())
}

/// Move the destination aside, move the staged bundle in, drop the aside copy.
fn swap(staged: &Path, dest: &Path) -> Result<(), UpdateError> {
    let aside = aside_path(dest);
    remove_path(&aside)?;

    let had_dest = path_exists(dest);
    if had_dest {
        move_path(dest, &aside)?;
    } else if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Err(e) = move_path(staged, dest) {
        let _ = remove_path(dest);
        if had_dest {
            move_path(&aside, dest).map_err(|undo| {
                UpdateError::RollbackFailed(format!("swap failed ({e}) and original could not be put back: {undo}"))
            })?;
        }
        return Err(UpdateError::InstallationFailed(format!("swap failed: {e}")));
    }

    if had_dest {
        if let Err(e) = remove_path(&aside) {
            warn!(path = %aside.display(), error = %e, "Failed to remove displaced bundle");
        }
    }
    Ok(())
}

fn bundle_name(source: &Path) -> PathBuf {
    source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bundle"))
}

/// Run a filesystem step to completion on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::InstallationFailed(format!("installer task failed: {e}")))?
}
