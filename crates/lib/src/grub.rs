//! Integration with the host's GRUB installation.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use grubenhancer_utils::CommandRunExt;

use crate::config::Config;

/// Marks the start of the block we append to `grub.cfg`.
const HOOK_BEGIN: &str = "### BEGIN GrubEnhancer Config ###";
/// Marks the end of the block we append to `grub.cfg`.
const HOOK_END: &str = "### END GrubEnhancer Config ###";

/// Makes GRUB source `custom.cfg` from its configuration directory.
const HOOK: &str = r#"if [ -f  ${config_directory}/custom.cfg ]; then
  source ${config_directory}/custom.cfg
elif [ -z "${config_directory}" -a -f  $prefix/custom.cfg ]; then
  source $prefix/custom.cfg;
fi
"#;

/// Where the ISO boot functions are installed, relative to the GRUB directory.
pub const FUNCTIONS_PATH: &str = "greffons/fonctions_iso.cfg";

const FUNCTIONS_TEMPLATE: &str = include_str!("fonctions_iso.cfg");

/// The GRUB tools we drive.
pub trait BootloaderTools {
    /// The filesystem GRUB sees `dir` on, e.g. `ext2`.
    fn probe_filesystem(&self, dir: &Utf8Path) -> Result<String>;
    /// The device GRUB sees `dir` on, e.g. `/dev/sda`.
    fn probe_disk(&self, dir: &Utf8Path) -> Result<String>;
    /// Set `flag=true` in the `grubenv` of `dir`.
    fn set_env_flag(&self, dir: &Utf8Path, flag: &str) -> Result<()>;
    /// Regenerate `grub.cfg` in `dir`.
    fn regenerate_config(&self, dir: &Utf8Path) -> Result<()>;
}

/// [`BootloaderTools`] backed by the `grub-*` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrubCommands;

fn first_word(output: &str) -> Result<String> {
    output
        .split_whitespace()
        .next()
        .map(ToOwned::to_owned)
        .context("Empty output")
}

impl GrubCommands {
    fn probe(&self, target: &str, dir: &Utf8Path) -> Result<String> {
        let out = Command::new("grub-probe")
            .arg(format!("--target={target}"))
            .arg(dir.as_str())
            .log_debug()
            .run_get_string()?;
        first_word(&out).with_context(|| format!("Probing {target} of {dir}"))
    }
}

impl BootloaderTools for GrubCommands {
    fn probe_filesystem(&self, dir: &Utf8Path) -> Result<String> {
        self.probe("fs", dir)
    }

    fn probe_disk(&self, dir: &Utf8Path) -> Result<String> {
        self.probe("disk", dir)
    }

    #[context("Setting {flag} in grubenv")]
    fn set_env_flag(&self, dir: &Utf8Path, flag: &str) -> Result<()> {
        Command::new("grub-editenv")
            .arg(dir.join("grubenv").as_str())
            .arg("set")
            .arg(format!("{flag}=true"))
            .log_debug()
            .run_capture_stderr()
    }

    #[context("Regenerating GRUB config")]
    fn regenerate_config(&self, dir: &Utf8Path) -> Result<()> {
        Command::new("grub-mkconfig")
            .args(["-o", dir.join("grub.cfg").as_str()])
            .log_debug()
            .run_capture_stderr()
    }
}

/// Whether the GRUB directory `dir` can hold permanent entries. GRUB cannot
/// write its environment block on some filesystems and devices, and the
/// configured lists name them.
#[context("Checking permanent entry support for {dir}")]
pub fn permanence_supported(
    dir: &Utf8Path,
    tools: &dyn BootloaderTools,
    config: &Config,
) -> Result<bool> {
    let fs = tools.probe_filesystem(dir)?;
    let disk = tools.probe_disk(dir)?;
    let r = config.permanence_allowed(&fs, &disk);
    tracing::debug!("{dir}: filesystem {fs} on {disk}, permanent entries allowed: {r}");
    Ok(r)
}

/// Returns `true` if `dir` holds a `grub.cfg`.
pub fn is_grub_dir(dir: &Dir) -> Result<bool> {
    Ok(dir.try_exists("grub.cfg")?)
}

/// Install what GRUB needs to use our entries in the directory `grub`:
/// a hook in `grub.cfg` sourcing `custom.cfg`, and the ISO boot
/// functions. Returns `true` if `grub.cfg` was changed.
///
/// Regenerating `grub.cfg` drops the hook, so this is run on every commit.
#[context("Installing GRUB hooks")]
pub fn install_hooks(grub: &Dir, env_flag: &str) -> Result<bool> {
    let cfg = grub
        .read_to_string("grub.cfg")
        .context("Reading grub.cfg")?;
    let changed = !cfg.contains(HOOK);
    if changed {
        let mut new = cfg;
        if !new.is_empty() && !new.ends_with('\n') {
            new.push('\n');
        }
        new.push_str(HOOK_BEGIN);
        new.push('\n');
        new.push_str(HOOK);
        new.push_str(HOOK_END);
        new.push('\n');
        grub.atomic_write("grub.cfg", new)
            .context("Writing grub.cfg")?;
        tracing::info!("Added custom.cfg hook to grub.cfg");
    }

    let functions = FUNCTIONS_TEMPLATE.replace("@ENV_FLAG@", env_flag);
    if let Some(parent) = Utf8Path::new(FUNCTIONS_PATH).parent() {
        grub.create_dir_all(parent.as_str())
            .with_context(|| format!("Creating {parent}"))?;
    }
    grub.atomic_write(FUNCTIONS_PATH, functions)
        .with_context(|| format!("Writing {FUNCTIONS_PATH}"))?;
    Ok(changed)
}

/// What to do with GRUB once `custom.cfg` is written.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostCommit {
    /// Arm temporary entries for the next boot
    pub activate_temporary: bool,
    /// Run `grub-mkconfig` first
    pub regenerate: bool,
}

/// Bring GRUB in `dir` up to date after a commit.
///
/// `temporary_pending` tells whether the written `custom.cfg` holds a
/// temporary entry; the environment flag is only raised if so.
#[context("Updating GRUB in {dir}")]
pub fn post_commit(
    dir: &Utf8Path,
    tools: &dyn BootloaderTools,
    env_flag: &str,
    opts: PostCommit,
    temporary_pending: bool,
) -> Result<()> {
    if opts.regenerate {
        tools.regenerate_config(dir)?;
    }
    let grub = Dir::open_ambient_dir(dir, cap_std_ext::cap_std::ambient_authority())
        .with_context(|| format!("Opening {dir}"))?;
    install_hooks(&grub, env_flag)?;
    match (opts.activate_temporary, temporary_pending) {
        (true, true) => tools.set_env_flag(dir, env_flag)?,
        (true, false) => tracing::info!("No temporary entry to activate"),
        (false, true) => tracing::info!("Temporary entry written but not activated"),
        (false, false) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use cap_std_ext::cap_std;
    use indoc::indoc;

    use super::*;

    #[derive(Debug, Default)]
    struct FakeTools {
        fs: &'static str,
        disk: &'static str,
        calls: RefCell<Vec<String>>,
    }

    impl BootloaderTools for FakeTools {
        fn probe_filesystem(&self, _dir: &Utf8Path) -> Result<String> {
            Ok(self.fs.to_owned())
        }

        fn probe_disk(&self, _dir: &Utf8Path) -> Result<String> {
            Ok(self.disk.to_owned())
        }

        fn set_env_flag(&self, dir: &Utf8Path, flag: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("editenv {dir} {flag}"));
            Ok(())
        }

        fn regenerate_config(&self, dir: &Utf8Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("mkconfig {dir}"));
            Ok(())
        }
    }

    fn fixture() -> Result<cap_std_ext::cap_tempfile::TempDir> {
        let tempdir = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?;
        tempdir.write("grub.cfg", "menuentry 'Linux' {\n}\n")?;
        Ok(tempdir)
    }

    #[test]
    fn test_first_word() -> Result<()> {
        assert_eq!(first_word("ext2\n")?, "ext2");
        assert_eq!(first_word("/dev/sda /dev/sdb\n")?, "/dev/sda");
        assert!(first_word("  \n").is_err());
        Ok(())
    }

    #[test]
    fn test_permanence_supported() -> Result<()> {
        let config = Config::default();
        let dir = Utf8Path::new("/boot/grub");
        let ok = FakeTools {
            fs: "ext2",
            disk: "/dev/sda",
            ..Default::default()
        };
        assert!(permanence_supported(dir, &ok, &config)?);
        let btrfs = FakeTools {
            fs: "btrfs",
            disk: "/dev/sda",
            ..Default::default()
        };
        assert!(!permanence_supported(dir, &btrfs, &config)?);
        let lvm = FakeTools {
            fs: "ext2",
            disk: "/dev/mapper/vg-root",
            ..Default::default()
        };
        assert!(!permanence_supported(dir, &lvm, &config)?);
        Ok(())
    }

    #[test]
    fn test_install_hooks() -> Result<()> {
        let td = fixture()?;
        assert!(is_grub_dir(&td)?);
        assert!(install_hooks(&td, "amorceiso")?);
        let expected = indoc! { r#"
            menuentry 'Linux' {
            }
            ### BEGIN GrubEnhancer Config ###
            if [ -f  ${config_directory}/custom.cfg ]; then
              source ${config_directory}/custom.cfg
            elif [ -z "${config_directory}" -a -f  $prefix/custom.cfg ]; then
              source $prefix/custom.cfg;
            fi
            ### END GrubEnhancer Config ###
        "# };
        similar_asserts::assert_eq!(td.read_to_string("grub.cfg")?, expected);
        let functions = td.read_to_string(FUNCTIONS_PATH)?;
        assert!(functions.contains("function iso_boot {"));
        assert!(functions.contains("save_env amorceiso"));
        assert!(!functions.contains("@ENV_FLAG@"));

        // Idempotent
        assert!(!install_hooks(&td, "amorceiso")?);
        similar_asserts::assert_eq!(td.read_to_string("grub.cfg")?, expected);
        Ok(())
    }

    #[test]
    fn test_install_hooks_not_grub() -> Result<()> {
        let td = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?;
        assert!(!is_grub_dir(&td)?);
        assert!(install_hooks(&td, "amorceiso").is_err());
        Ok(())
    }

    #[test]
    fn test_post_commit() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(dir.join("grub.cfg"), "")?;
        let opts = PostCommit {
            activate_temporary: true,
            regenerate: true,
        };

        let tools = FakeTools::default();
        post_commit(dir, &tools, "amorceiso", opts, false)?;
        assert_eq!(*tools.calls.borrow(), [format!("mkconfig {dir}")]);
        assert!(std::fs::read_to_string(dir.join("grub.cfg"))?.starts_with(HOOK_BEGIN));

        let tools = FakeTools::default();
        post_commit(dir, &tools, "amorceiso", opts, true)?;
        assert_eq!(
            *tools.calls.borrow(),
            [format!("mkconfig {dir}"), format!("editenv {dir} amorceiso")]
        );

        let tools = FakeTools::default();
        post_commit(dir, &tools, "amorceiso", PostCommit::default(), true)?;
        assert!(tools.calls.borrow().is_empty());
        Ok(())
    }
}
