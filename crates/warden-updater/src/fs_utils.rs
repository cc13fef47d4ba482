//! Filesystem helpers shared by the installer and the rollback store.

use std::fs;
use std::io;
use std::path::Path;

/// Copy a file or directory tree, preserving symlinks and permissions.
pub fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;

    if metadata.file_type().is_symlink() {
        copy_symlink(source, dest)
    } else if metadata.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        fs::set_permissions(dest, metadata.permissions())
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
        Ok(())
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(source)?;
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest).map(|_| ())
}

/// Remove a file or directory tree if it exists.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether anything (file, directory or dangling symlink) exists at `path`.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Move `source` to `dest`, falling back to copy-and-delete across volumes.
pub fn move_path(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(source, dest)?;
            remove_path(source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_copies_nested_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/file"), b"data").unwrap();

        let dst = temp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a/b/file")).unwrap(), b"data");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_preserves_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real"), b"x").unwrap();
        std::os::unix::fs::symlink("real", src.join("link")).unwrap();

        let dst = temp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert!(fs::symlink_metadata(dst.join("link"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_remove_path_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_path(&temp.path().join("missing")).unwrap();
    }

    #[test]
    fn test_move_path() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f"), b"1").unwrap();
        let dst = temp.path().join("dst");

        move_path(&src, &dst).unwrap();
        assert!(!path_exists(&src));
        assert_eq!(fs::read(dst.join("f")).unwrap(), b"1");
    }
}
