//! Directory tree cloning and size accounting (§4.8/§4.10).

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use crate::core::error::{PhiockerError, Result};

const PERMISSIVE_DIR_MODE: u32 = 0o755;

/// Creates `dir` (and parents) with mode 0755 if it doesn't already exist.
pub fn set_parent_dirs_permissive(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(PhiockerError::Io)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(PERMISSIVE_DIR_MODE))
        .map_err(PhiockerError::Io)
}

/// Recursively copies `src` into `dst`. Files preserve their mode bits,
/// directories recurse, symlinks are preserved verbatim (the destination is
/// unlinked first if something is already there).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(PhiockerError::Io)?;

    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(PhiockerError::Io)?;
        fs::set_permissions(dst, meta.permissions()).map_err(PhiockerError::Io)?;
        for entry in fs::read_dir(src).map_err(PhiockerError::Io)? {
            let entry = entry.map_err(PhiockerError::Io)?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).map_err(PhiockerError::Io)?;
        let _ = fs::remove_file(dst);
        symlink(&target, dst).map_err(PhiockerError::Io)?;
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        set_parent_dirs_permissive(parent)?;
    }
    fs::copy(src, dst).map_err(PhiockerError::Io)?;
    fs::set_permissions(dst, meta.permissions()).map_err(PhiockerError::Io)?;
    Ok(())
}

/// Sum of file sizes under `path`, recursing into directories. Symlinks count
/// their own directory-entry size, not the target's.
pub fn directory_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path).map_err(PhiockerError::Io)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in fs::read_dir(path).map_err(PhiockerError::Io)? {
        let entry = entry.map_err(PhiockerError::Io)?;
        total += directory_size(&entry.path())?;
    }
    Ok(total)
}

pub fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    Ok(fs::read_dir(path).map_err(PhiockerError::Io)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_tree_preserves_file_content_and_nested_dirs() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/hello.txt"), b"Hello\n").unwrap();

        copy_tree(src.path(), &dst.path().join("rootfs")).unwrap();

        let copied = dst.path().join("rootfs/nested/hello.txt");
        assert_eq!(fs::read(copied).unwrap(), b"Hello\n");
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("real.txt"), b"data").unwrap();
        symlink("real.txt", src.path().join("link.txt")).unwrap();

        copy_tree(src.path(), &dst.path().join("rootfs")).unwrap();

        let link = dst.path().join("rootfs/link.txt");
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("real.txt"));
    }

    #[test]
    fn directory_size_sums_nested_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"1234").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), b"12345678").unwrap();

        assert_eq!(directory_size(dir.path()).unwrap(), 12);
    }

    #[test]
    fn is_empty_dir_reports_correctly() {
        let dir = tempdir().unwrap();
        assert!(is_empty_dir(dir.path()).unwrap());
        fs::write(dir.path().join("x"), b"1").unwrap();
        assert!(!is_empty_dir(dir.path()).unwrap());
    }
}
