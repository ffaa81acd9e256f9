//! Conversions between host paths and the mount-relative paths GRUB uses.
//!
//! GRUB resolves a path against the device it searched for, not against
//! the host's `/`, so `custom.cfg` stores every location relative to the
//! mount point of the filesystem holding it.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConfigError;

/// Find the mount point of the filesystem holding `path`.
pub fn find_mount(path: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    grubenhancer_mount::find_mount(path).map_err(|e| ConfigError::UnresolvedMount {
        path: path.to_owned(),
        reason: format!("{e:#}"),
    })
}

/// Strip `mount_point` from `path`. The result always starts with a
/// single `/`.
pub fn to_relative(path: &Utf8Path, mount_point: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let rest = path
        .strip_prefix(mount_point)
        .map_err(|_| ConfigError::UnresolvedMount {
            path: path.to_owned(),
            reason: format!("not below {mount_point}"),
        })?;
    Ok(Utf8Path::new("/").join(rest))
}

/// The inverse of [`to_relative`].
pub fn to_absolute(relative: &Utf8Path, mount_point: &Utf8Path) -> Utf8PathBuf {
    let rest = relative.as_str().trim_start_matches('/');
    if rest.is_empty() {
        mount_point.to_owned()
    } else {
        mount_point.join(rest)
    }
}

/// Resolve an absolute ISO path into its mount point and mount-relative form.
pub fn resolve(path: &Utf8Path) -> Result<(Utf8PathBuf, Utf8PathBuf), ConfigError> {
    let mount_point = find_mount(path)?;
    let relative = to_relative(path, &mount_point)?;
    Ok((mount_point, relative))
}
