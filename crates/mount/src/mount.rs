//! Helpers for locating the filesystem a path lives on, and for
//! temporarily mounting ISO images.

use anyhow::{Context, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FileType;
use rustix::io::Errno;

mod tempmount;
pub use tempmount::TempMount;

/// Returns `true` if `path` is the root directory of a mounted filesystem.
///
/// Symlinks and paths that do not exist are never mount points.
#[context("Checking whether {path} is a mount point")]
pub fn is_mountpoint(path: &Utf8Path) -> Result<bool> {
    let st = match rustix::fs::lstat(path.as_std_path()) {
        Ok(st) => st,
        Err(Errno::NOENT) | Err(Errno::NOTDIR) => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("lstat {path}")),
    };
    if FileType::from_raw_mode(st.st_mode) != FileType::Directory {
        return Ok(false);
    }
    let dir = Dir::open_ambient_dir(path, ambient_authority())
        .with_context(|| format!("Opening {path}"))?;
    match dir.is_mountpoint(".")? {
        Some(r) => Ok(r),
        // statx did not say
        None => differs_from_parent(path),
    }
}

/// A directory on another device than its parent, or its own parent, is a
/// mount point.
fn differs_from_parent(path: &Utf8Path) -> Result<bool> {
    let st = rustix::fs::lstat(path.as_std_path()).with_context(|| format!("lstat {path}"))?;
    let parent = path.join("..");
    let pst = rustix::fs::lstat(parent.as_std_path()).with_context(|| format!("lstat {parent}"))?;
    Ok(st.st_dev != pst.st_dev || st.st_ino == pst.st_ino)
}

/// Find the mount point of the filesystem containing `path`.
///
/// Walks from `path` upwards until a directory that is a mount point
/// (or `/`) is found.
pub fn find_mount(path: &Utf8Path) -> Result<Utf8PathBuf> {
    find_mount_with(path, is_mountpoint)
}

/// Like [`find_mount`], but with a caller-provided mount point predicate.
#[context("Finding mount point of {path}")]
pub fn find_mount_with<F>(path: &Utf8Path, mut is_mount: F) -> Result<Utf8PathBuf>
where
    F: FnMut(&Utf8Path) -> Result<bool>,
{
    anyhow::ensure!(path.is_absolute(), "Not an absolute path");
    if path
        .components()
        .any(|c| matches!(c, Utf8Component::ParentDir | Utf8Component::CurDir))
    {
        anyhow::bail!("Path must not contain . or .. components");
    }
    for dir in path.ancestors() {
        if dir.parent().is_none() || is_mount(dir)? {
            tracing::trace!("mount point of {path}: {dir}");
            return Ok(dir.to_owned());
        }
    }
    // ancestors() of an absolute path always ends at the root
    anyhow::bail!("No mount point found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_mountpoint() -> Result<()> {
        assert!(is_mountpoint(Utf8Path::new("/"))?);
        assert!(!is_mountpoint(Utf8Path::new("/nonexistent/path/for/test"))?);
        Ok(())
    }

    #[test]
    fn test_differs_from_parent() -> Result<()> {
        assert!(differs_from_parent(Utf8Path::new("/"))?);
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).context("non UTF-8 tempdir")?;
        std::fs::create_dir(dir.join("sub"))?;
        assert!(!differs_from_parent(&dir.join("sub"))?);
        assert!(!is_mountpoint(&dir.join("sub"))?);
        Ok(())
    }

    #[test]
    fn test_find_mount_with() -> Result<()> {
        let is_mnt = |p: &Utf8Path| anyhow::Ok(p.as_str() == "/mnt");
        assert_eq!(find_mount_with(Utf8Path::new("/mnt/isos/ubuntu.iso"), is_mnt)?, "/mnt");
        assert_eq!(find_mount_with(Utf8Path::new("/mnt"), is_mnt)?, "/mnt");
        assert_eq!(find_mount_with(Utf8Path::new("/srv/isos/a.iso"), is_mnt)?, "/");
        assert_eq!(find_mount_with(Utf8Path::new("/"), is_mnt)?, "/");
        Ok(())
    }

    #[test]
    fn test_find_mount_malformed() {
        let never = |_: &Utf8Path| anyhow::Ok(false);
        assert!(find_mount_with(Utf8Path::new("isos/a.iso"), never).is_err());
        assert!(find_mount_with(Utf8Path::new("/mnt/../etc"), never).is_err());
    }

    #[test]
    fn test_find_mount_real() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).context("non UTF-8 tempdir")?;
        let iso = dir.join("live.iso");
        std::fs::write(&iso, b"")?;
        let mnt = find_mount(&iso)?;
        assert!(iso.starts_with(&mnt));
        assert!(is_mountpoint(&mnt)?);
        Ok(())
    }
}
