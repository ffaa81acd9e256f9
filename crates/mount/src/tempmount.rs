use std::process::Command;

use anyhow::{Context, Result};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use fn_error_context::context;
use grubenhancer_utils::CommandRunExt;
use rustix::mount::{unmount, UnmountFlags};

/// A filesystem mounted on a temporary directory, unmounted on drop.
#[derive(Debug)]
pub struct TempMount {
    /// The temporary directory used as mount point
    pub dir: tempfile::TempDir,
    /// The root of the mounted filesystem
    pub fd: Dir,
}

impl TempMount {
    /// Mount an ISO image read-only via a loop device.
    #[context("Mounting {iso}")]
    pub fn mount_iso(iso: &Utf8Path) -> Result<Self> {
        let tempdir = tempfile::TempDir::new()?;

        let target = Utf8PathBuf::from_path_buf(tempdir.path().to_owned())
            .map_err(|p| anyhow::anyhow!("Non UTF-8 tempdir: {p:?}"))?;

        Command::new("mount")
            .args(["-o", "loop,ro"])
            .args([iso.as_str(), target.as_str()])
            .log_debug()
            .run_capture_stderr()?;

        let fd = Dir::open_ambient_dir(&target, ambient_authority())
            .with_context(|| format!("Opening {target}"));

        let fd = match fd {
            Ok(fd) => fd,
            Err(e) => {
                unmount(tempdir.path(), UnmountFlags::DETACH)?;
                Err(e)?
            }
        };

        Ok(Self { dir: tempdir, fd })
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        match unmount(self.dir.path(), UnmountFlags::DETACH) {
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to unmount ISO: {e:?}"),
        }
    }
}
