//! Downloaded artifact handling.
//!
//! Turns a downloaded file into an installable application bundle:
//! disk images are attached read-only, archives are extracted, and the
//! result is searched for a `.app` bundle. Installer packages are run
//! through `installer` instead of the atomic installer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::executor::SafeExecutor;

/// Deepest directory level searched for a bundle.
pub const MAX_BUNDLE_DEPTH: usize = 4;

/// Artifact kinds the installer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    DiskImage,
    InstallerPackage,
    Zip,
    Tar,
    /// Already an application bundle directory
    Bundle,
}

impl ArtifactFormat {
    /// Classify by file name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        let format = if name.ends_with(".dmg") {
            Self::DiskImage
        } else if name.ends_with(".pkg") || name.ends_with(".mpkg") {
            Self::InstallerPackage
        } else if name.ends_with(".zip") {
            Self::Zip
        } else if [".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz", ".tar.xz", ".txz"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            Self::Tar
        } else if name.ends_with(".app") {
            Self::Bundle
        } else {
            return None;
        };
        Some(format)
    }

    /// Classify by name, falling back to the file's magic bytes.
    pub fn detect(path: &Path) -> Result<Self, UpdateError> {
        if path.is_dir() {
            return if is_bundle_name(path) {
                Ok(Self::Bundle)
            } else {
                Err(UpdateError::UnsupportedArtifact(format!("{} is a directory", path.display())))
            };
        }
        if let Some(format) = path.file_name().and_then(|n| n.to_str()).and_then(Self::from_name) {
            return Ok(format);
        }
        sniff(path)?.ok_or_else(|| UpdateError::UnsupportedArtifact(path.display().to_string()))
    }
}

/// Identify a file from its leading (or, for disk images, trailing) bytes.
pub fn sniff(path: &Path) -> Result<Option<ArtifactFormat>, UpdateError> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 6];
    let read = file.read(&mut head)?;
    let head = &head[..read];

    let format = if head.starts_with(b"PK\x03\x04") {
        Some(ArtifactFormat::Zip)
    } else if head.starts_with(b"xar!") {
        Some(ArtifactFormat::InstallerPackage)
    } else if head.starts_with(&[0x1f, 0x8b]) || head.starts_with(b"BZh") || head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some(ArtifactFormat::Tar)
    } else {
        // UDIF images end with a 512-byte "koly" trailer
        let len = file.metadata()?.len();
        if len >= 512 {
            let mut trailer = [0u8; 4];
            file.seek(SeekFrom::Start(len - 512))?;
            file.read_exact(&mut trailer)?;
            (&trailer == b"koly").then_some(ArtifactFormat::DiskImage)
        } else {
            None
        }
    };
    Ok(format)
}

fn is_bundle_name(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("app"))
}

/// Breadth-first search for an application bundle under `root`.
///
/// Symlinks are never followed (disk images commonly carry an
/// `Applications` link) and bundles are not searched inside.
pub fn find_app_bundle(root: &Path, max_depth: usize) -> Result<Option<PathBuf>, UpdateError> {
    let mut level = vec![root.to_path_buf()];
    for _ in 0..max_depth {
        let mut next = Vec::new();
        for dir in &level {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect();
            entries.sort();

            if let Some(bundle) = entries.iter().find(|path| is_bundle_name(path)) {
                return Ok(Some(bundle.clone()));
            }
            next.extend(entries);
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }
    Ok(None)
}

/// What a downloaded artifact resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedArtifact {
    /// A bundle on a regular filesystem
    Bundle(PathBuf),
    /// A bundle inside an attached disk image; detach when done
    Mounted { mountpoint: PathBuf, bundle: PathBuf },
    /// An installer package
    Package(PathBuf),
}

impl ResolvedArtifact {
    pub fn bundle(&self) -> Option<&Path> {
        match self {
            Self::Bundle(path) | Self::Mounted { bundle: path, .. } => Some(path),
            Self::Package(_) => None,
        }
    }
}

/// Runs the mount, extract and package tools.
#[derive(Debug, Clone)]
pub struct ArtifactHandler {
    executor: Arc<SafeExecutor>,
    timeout: Duration,
}

impl ArtifactHandler {
    pub fn new(executor: Arc<SafeExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Resolve `artifact` to something installable, using `work_dir` for
    /// extraction output and mountpoints.
    pub async fn resolve(&self, artifact: &Path, work_dir: &Path) -> Result<ResolvedArtifact, UpdateError> {
        let format = ArtifactFormat::detect(artifact)?;
        debug!(artifact = %artifact.display(), ?format, "Resolving artifact");

        match format {
            ArtifactFormat::Bundle => Ok(ResolvedArtifact::Bundle(artifact.to_path_buf())),
            ArtifactFormat::InstallerPackage => Ok(ResolvedArtifact::Package(artifact.to_path_buf())),
            ArtifactFormat::Zip | ArtifactFormat::Tar => {
                let out = work_dir.join("extracted");
                tokio::fs::create_dir_all(&out).await?;
                if format == ArtifactFormat::Zip {
                    self.extract_zip(artifact, &out).await?;
                } else {
                    self.extract_tar(artifact, &out).await?;
                }
                find_app_bundle(&out, MAX_BUNDLE_DEPTH)?
                    .map(ResolvedArtifact::Bundle)
                    .ok_or_else(|| UpdateError::ExtractionFailed("archive contains no application bundle".into()))
            }
            ArtifactFormat::DiskImage => {
                let mountpoint = work_dir.join("mount");
                tokio::fs::create_dir_all(&mountpoint).await?;
                self.attach(artifact, &mountpoint).await?;
                match find_app_bundle(&mountpoint, MAX_BUNDLE_DEPTH) {
                    Ok(Some(bundle)) => Ok(ResolvedArtifact::Mounted { mountpoint, bundle }),
                    Ok(None) => {
                        self.detach(&mountpoint).await;
                        Err(UpdateError::MountFailed("disk image contains no application bundle".into()))
                    }
                    Err(e) => {
                        self.detach(&mountpoint).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Undo whatever [`resolve`](Self::resolve) set up.
    pub async fn release(&self, resolved: &ResolvedArtifact) {
        if let ResolvedArtifact::Mounted { mountpoint, .. } = resolved {
            self.detach(mountpoint).await;
        }
    }

    pub async fn attach(&self, image: &Path, mountpoint: &Path) -> Result<(), UpdateError> {
        let image = image.to_string_lossy();
        let mount = mountpoint.to_string_lossy();
        let output = self
            .executor
            .execute(
                "hdiutil",
                &["attach", "-nobrowse", "-readonly", "-mountpoint", &*mount, &*image],
                self.timeout,
                None,
            )
            .await
            .map_err(|e| UpdateError::MountFailed(e.to_string()))?;
        if !output.success() {
            return Err(UpdateError::MountFailed(output.stderr.trim().to_string()));
        }
        info!(image = %image, mountpoint = %mount, "Disk image attached");
        Ok(())
    }

    /// Force-detach; failures are logged, never returned.
    pub async fn detach(&self, mountpoint: &Path) {
        let mount = mountpoint.to_string_lossy();
        match self
            .executor
            .execute("hdiutil", &["detach", "-force", &*mount], self.timeout, None)
            .await
        {
            Ok(output) if output.success() => debug!(mountpoint = %mount, "Disk image detached"),
            Ok(output) => warn!(mountpoint = %mount, stderr = %output.stderr.trim(), "Detach failed"),
            Err(e) => warn!(mountpoint = %mount, error = %e, "Detach failed"),
        }
    }

    pub async fn extract_zip(&self, archive: &Path, dest: &Path) -> Result<(), UpdateError> {
        self.extract("ditto", &["-x", "-k", &*archive.to_string_lossy(), &*dest.to_string_lossy()])
            .await
    }

    pub async fn extract_tar(&self, archive: &Path, dest: &Path) -> Result<(), UpdateError> {
        self.extract("tar", &["-xf", &*archive.to_string_lossy(), "-C", &*dest.to_string_lossy()])
            .await
    }

    async fn extract(&self, tool: &str, args: &[&str]) -> Result<(), UpdateError> {
        let output = self
            .executor
            .execute(tool, args, self.timeout, None)
            .await
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))?;
        if !output.success() {
            return Err(UpdateError::ExtractionFailed(format!(
                "{tool} exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Run an installer package against the boot volume.
    pub async fn install_package(&self, package: &Path, timeout: Duration) -> Result<(), UpdateError> {
        let package = package.to_string_lossy();
        info!(package = %package, "Running installer package");
        let output = self
            .executor
            .execute("installer", &["-pkg", &*package, "-target", "/"], timeout, None)
            .await?;
        if !output.success() {
            return Err(UpdateError::InstallationFailed(format!(
                "installer exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_name() {
        assert_eq!(ArtifactFormat::from_name("App-1.2.DMG"), Some(ArtifactFormat::DiskImage));
        assert_eq!(ArtifactFormat::from_name("tool.pkg"), Some(ArtifactFormat::InstallerPackage));
        assert_eq!(ArtifactFormat::from_name("a.zip"), Some(ArtifactFormat::Zip));
        assert_eq!(ArtifactFormat::from_name("a.tar.gz"), Some(ArtifactFormat::Tar));
        assert_eq!(ArtifactFormat::from_name("a.tgz"), Some(ArtifactFormat::Tar));
        assert_eq!(ArtifactFormat::from_name("readme.txt"), None);
    }

    #[test]
    fn test_sniff_magic_bytes() {
        let temp = TempDir::new().unwrap();
        let zip = temp.path().join("download");
        fs::write(&zip, b"PK\x03\x04rest").unwrap();
        assert_eq!(ArtifactFormat::detect(&zip).unwrap(), ArtifactFormat::Zip);

        let dmg = temp.path().join("image");
        let mut bytes = vec![0u8; 2048];
        bytes[2048 - 512..2048 - 508].copy_from_slice(b"koly");
        fs::write(&dmg, &bytes).unwrap();
        assert_eq!(ArtifactFormat::detect(&dmg).unwrap(), ArtifactFormat::DiskImage);

        let junk = temp.path().join("junk");
        fs::write(&junk, b"hello").unwrap();
        assert!(matches!(ArtifactFormat::detect(&junk), Err(UpdateError::UnsupportedArtifact(_))));
    }

    #[test]
    fn test_find_bundle_respects_depth() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b/c/Deep.app/Contents")).unwrap();
        assert_eq!(
            find_app_bundle(temp.path(), MAX_BUNDLE_DEPTH).unwrap(),
            Some(temp.path().join("a/b/c/Deep.app"))
        );
        assert_eq!(find_app_bundle(temp.path(), 2).unwrap(), None);

        let deeper = TempDir::new().unwrap();
        fs::create_dir_all(deeper.path().join("1/2/3/4/5/Too.app")).unwrap();
        assert_eq!(find_app_bundle(deeper.path(), MAX_BUNDLE_DEPTH).unwrap(), None);
    }

    #[test]
    fn test_find_bundle_prefers_shallowest_and_skips_inner_bundles() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Outer.app/Contents/Helpers/Inner.app")).unwrap();
        fs::create_dir_all(temp.path().join("docs/Other.app")).unwrap();
        assert_eq!(
            find_app_bundle(temp.path(), MAX_BUNDLE_DEPTH).unwrap(),
            Some(temp.path().join("Outer.app"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_find_bundle_ignores_symlinks() {
        let temp = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        fs::create_dir_all(elsewhere.path().join("System.app")).unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), temp.path().join("Applications")).unwrap();
        assert_eq!(find_app_bundle(temp.path(), MAX_BUNDLE_DEPTH).unwrap(), None);
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_failure_is_mount_failed() {
        let temp = TempDir::new().unwrap();
        let hdiutil = fake_tool(temp.path(), "hdiutil", "echo 'attach failed' >&2; exit 1");
        let handler = ArtifactHandler::new(
            Arc::new(SafeExecutor::empty().with_tool("hdiutil", hdiutil)),
            Duration::from_secs(5),
        );
        let image = temp.path().join("App.dmg");
        fs::write(&image, b"not really a dmg").unwrap();

        let err = handler.resolve(&image, &temp.path().join("work")).await.unwrap_err();
        assert!(matches!(err, UpdateError::MountFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_image_is_detached() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("calls.log");
        let hdiutil = fake_tool(temp.path(), "hdiutil", &format!("echo \"$1\" >> {}", log.display()));
        let handler = ArtifactHandler::new(
            Arc::new(SafeExecutor::empty().with_tool("hdiutil", hdiutil)),
            Duration::from_secs(5),
        );
        let image = temp.path().join("App.dmg");
        fs::write(&image, b"image").unwrap();

        let err = handler.resolve(&image, &temp.path().join("work")).await.unwrap_err();
        assert!(matches!(err, UpdateError::MountFailed(_)));
        assert_eq!(fs::read_to_string(&log).unwrap(), "attach\ndetach\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tar_extraction_finds_bundle() {
        let Some(tar) = ["/usr/bin/tar", "/bin/tar"].into_iter().find(|p| Path::new(p).exists()) else {
            return;
        };
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("Tool.app/Contents")).unwrap();
        fs::write(src.join("Tool.app/Contents/Info.plist"), b"<plist/>").unwrap();
        let archive = temp.path().join("Tool.tar");
        let status = std::process::Command::new(tar)
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(&src)
            .arg("Tool.app")
            .status()
            .unwrap();
        assert!(status.success());

        let handler = ArtifactHandler::new(
            Arc::new(SafeExecutor::empty().with_tool("tar", tar)),
            Duration::from_secs(10),
        );
        let work = temp.path().join("work");
        let resolved = handler.resolve(&archive, &work).await.unwrap();
        assert_eq!(resolved, ResolvedArtifact::Bundle(work.join("extracted/Tool.app")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_extraction_is_extraction_error() {
        let temp = TempDir::new().unwrap();
        let tar = fake_tool(temp.path(), "tar", "exit 2");
        let handler = ArtifactHandler::new(
            Arc::new(SafeExecutor::empty().with_tool("tar", tar)),
            Duration::from_secs(5),
        );
        let archive = temp.path().join("broken.tar.gz");
        fs::write(&archive, b"junk").unwrap();

        let err = handler.resolve(&archive, &temp.path().join("work")).await.unwrap_err();
        assert!(matches!(err, UpdateError::ExtractionFailed(_)));
    }
}
