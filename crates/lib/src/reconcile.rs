//! Write an [`EntryStore`] back to disk.
//!
//! Committing a store happens in three steps:
//!
//! 1. Loopback bodies that were loaded or edited are written next to
//!    their ISO.
//! 2. GRUB's `iso_boot` cannot cope with whitespace in paths, so any ISO or
//!    loopback file whose mount-relative path contains whitespace gets a
//!    hard link at the root of its mount, named after the file, and the
//!    entry is pointed at that link instead.
//! 3. `custom.cfg` is replaced atomically.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::ambient_authority;
use cap_std_ext::cap_std::fs::{Dir, MetadataExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use serde::Serialize;

use crate::entry::EntryRecord;
use crate::error::{ConfigError, IoResultExt};
use crate::store::{CUSTOM_CFG, EntryStore};

/// The result of [`commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    /// Loopback files written, as host paths
    pub loopbacks_written: Vec<Utf8PathBuf>,
    /// Hard links created, as host paths
    pub aliases_created: Vec<Utf8PathBuf>,
    /// At least one temporary entry was written, so the GRUB environment
    /// flag needs raising for it to boot.
    pub temporary_pending: bool,
}

fn has_whitespace(p: &Utf8Path) -> bool {
    p.as_str().chars().any(char::is_whitespace)
}

/// Cap-std paths are relative to the mount directory.
fn dir_relative(location: &Utf8Path) -> &str {
    location.as_str().trim_start_matches('/')
}

fn open_mount(mount_point: &Utf8Path) -> Result<Dir, ConfigError> {
    Dir::open_ambient_dir(mount_point, ambient_authority())
        .io_context(|| format!("Opening mount point {mount_point}"))
}

/// Give the file at `location` a whitespace-free name at the root of its
/// mount. Returns the new mount-relative location, and whether a link was
/// created rather than found.
fn establish_alias(
    mount: &Dir,
    mount_point: &Utf8Path,
    location: &Utf8Path,
) -> Result<(Utf8PathBuf, bool), ConfigError> {
    let target = mount_point.join(dir_relative(location));
    let Some(name) = location.file_name() else {
        return Err(ConfigError::AliasConflict {
            alias: location.to_owned(),
            target,
            reason: "no file name".into(),
        });
    };
    let alias = Utf8Path::new("/").join(name);
    let conflict = |reason: &str| ConfigError::AliasConflict {
        alias: mount_point.join(name),
        target: target.clone(),
        reason: reason.to_owned(),
    };
    if has_whitespace(Utf8Path::new(name)) {
        return Err(conflict("file name contains whitespace"));
    }

    let src = dir_relative(location);
    match mount.hard_link(src, mount, name) {
        Ok(()) => {
            tracing::info!("Linked {target} as {}", mount_point.join(name));
            return Ok((alias, true));
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(ConfigError::io(
                format!("Linking {target} to {}", mount_point.join(name)),
                e,
            ));
        }
    }
    // An alias from a previous commit is fine as long as it is the same file.
    let existing = mount
        .symlink_metadata(name)
        .io_context(|| format!("Inspecting {}", mount_point.join(name)))?;
    let wanted = mount
        .metadata(src)
        .io_context(|| format!("Inspecting {target}"))?;
    if existing.dev() == wanted.dev() && existing.ino() == wanted.ino() {
        tracing::debug!("Reusing existing alias {}", mount_point.join(name));
        return Ok((alias, false));
    }
    Err(conflict("a different file already exists there"))
}

/// Whether committing `entry` touches its mount at all.
fn needs_mount(entry: &EntryRecord) -> bool {
    (entry.loopback_content.is_some() && entry.loopback_location.is_some())
        || has_whitespace(&entry.iso_location)
        || entry.loopback_location.as_deref().is_some_and(has_whitespace)
}

fn reconcile_entry(
    entry: &mut EntryRecord,
    outcome: &mut CommitOutcome,
) -> Result<(), ConfigError> {
    // The disk of an entry with nothing to write may well be unplugged.
    if !needs_mount(entry) {
        return Ok(());
    }
    let mount_point = entry.mount_point.clone();
    let mount = open_mount(&mount_point)?;

    if let (Some(content), Some(location)) = (&entry.loopback_content, &entry.loopback_location) {
        let path = mount_point.join(dir_relative(location));
        mount
            .atomic_write(dir_relative(location), content)
            .io_context(|| format!("Writing loopback file {path}"))?;
        tracing::info!("Wrote {path}");
        outcome.loopbacks_written.push(path);
    }

    if has_whitespace(&entry.iso_location) {
        let (alias, created) = establish_alias(&mount, &mount_point, &entry.iso_location)?;
        if created {
            outcome.aliases_created.push(mount_point.join(dir_relative(&alias)));
        }
        entry.iso_location = alias;
    }
    if let Some(location) = entry.loopback_location.as_deref().filter(|l| has_whitespace(l)) {
        let (alias, created) = establish_alias(&mount, &mount_point, location)?;
        if created {
            outcome.aliases_created.push(mount_point.join(dir_relative(&alias)));
        }
        entry.loopback_location = Some(alias);
    }
    Ok(())
}

/// Write every configured entry of `store` and its `custom.cfg` to disk.
///
/// Fails on the first error; `custom.cfg` is only replaced if every
/// loopback file and alias could be written.
pub fn commit(store: &mut EntryStore) -> Result<CommitOutcome, ConfigError> {
    let mut outcome = CommitOutcome::default();
    for entry in store.entries_mut().filter(|e| !e.is_placeholder()) {
        reconcile_entry(entry, &mut outcome)?;
        outcome.temporary_pending |= !entry.permanent;
    }

    let text = store.serialize()?;
    let dir = store.dir().to_owned();
    let d = Dir::open_ambient_dir(&dir, ambient_authority())
        .io_context(|| format!("Opening {dir}"))?;
    d.atomic_write(CUSTOM_CFG, text)
        .io_context(|| format!("Writing {dir}/{CUSTOM_CFG}"))?;
    tracing::info!("Wrote {dir}/{CUSTOM_CFG}");
    // The commit itself has succeeded at this point.
    if let Err(e) = store.refresh_all() {
        tracing::warn!("Failed to refresh entries of {dir}: {e}");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt as _;

    use anyhow::Result;

    use super::*;
    use crate::parsers::custom_cfg::INCIPIT;

    struct Fixture {
        _td: tempfile::TempDir,
        mount: Utf8PathBuf,
        grub: Utf8PathBuf,
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::tempdir()?;
        let mount = Utf8PathBuf::from_path_buf(td.path().to_owned())
            .map_err(|p| anyhow::anyhow!("non UTF-8 tempdir {p:?}"))?;
        let grub = mount.join("boot/grub");
        std::fs::create_dir_all(&grub)?;
        Ok(Fixture {
            _td: td,
            mount,
            grub,
        })
    }

    fn store_with_iso(fx: &Fixture, iso: &str) -> Result<(EntryStore, crate::entry::EntryId)> {
        let path = fx.mount.join(iso.trim_start_matches('/'));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, b"ISO")?;
        let mut store = EntryStore::load(fx.grub.as_path(), "")?;
        let (id, _) = store.entries().next().unwrap();
        store.set_iso_location_under(id, &path, &fx.mount)?;
        store.set_permanent(id, false)?;
        Ok((store, id))
    }

    #[test]
    fn test_commit_writes_custom_cfg() -> Result<()> {
        let fx = fixture()?;
        let (mut store, _) = store_with_iso(&fx, "/isos/test.iso")?;
        let outcome = commit(&mut store)?;
        assert!(outcome.temporary_pending);
        assert!(outcome.aliases_created.is_empty());
        let written = std::fs::read_to_string(fx.grub.join(CUSTOM_CFG))?;
        similar_asserts::assert_eq!(
            written,
            format!("{INCIPIT}\namorce_iso \"/isos/test.iso\" #{}\n", fx.mount)
        );
        Ok(())
    }

    #[test]
    fn test_placeholder_only() -> Result<()> {
        let fx = fixture()?;
        let mut store = EntryStore::load(fx.grub.as_path(), "")?;
        let outcome = commit(&mut store)?;
        assert_eq!(outcome, CommitOutcome::default());
        let written = std::fs::read_to_string(fx.grub.join(CUSTOM_CFG))?;
        assert_eq!(written, format!("{INCIPIT}\n"));
        Ok(())
    }

    #[test]
    fn test_loopback_written() -> Result<()> {
        let fx = fixture()?;
        let (mut store, id) = store_with_iso(&fx, "/isos/test.iso")?;
        store.set_permanent(id, true)?;
        store.set_loopback_content(id, "menuentry test {}\n")?;
        let outcome = commit(&mut store)?;
        assert!(!outcome.temporary_pending);
        let loopback = fx.mount.join("isos/test.loopback.cfg");
        assert_eq!(outcome.loopbacks_written, [loopback.clone()]);
        assert_eq!(std::fs::read_to_string(&loopback)?, "menuentry test {}\n");
        Ok(())
    }

    #[test]
    fn test_whitespace_alias() -> Result<()> {
        let fx = fixture()?;
        let (mut store, id) = store_with_iso(&fx, "/My Movies/live.iso")?;
        let outcome = commit(&mut store)?;

        let alias = fx.mount.join("live.iso");
        assert_eq!(outcome.aliases_created, [alias.clone()]);
        let e = store.get(id)?;
        assert_eq!(e.iso_location, "/live.iso");
        assert!(e.enabled);
        let orig = std::fs::metadata(fx.mount.join("My Movies/live.iso"))?;
        let linked = std::fs::metadata(&alias)?;
        assert_eq!(orig.ino(), linked.ino());

        let written = std::fs::read_to_string(fx.grub.join(CUSTOM_CFG))?;
        assert!(written.contains("amorce_iso \"/live.iso\" #"));
        assert!(!written.contains("My Movies"));
        Ok(())
    }

    #[test]
    fn test_whitespace_alias_exists() -> Result<()> {
        let fx = fixture()?;
        let (mut store, id) = store_with_iso(&fx, "/My Movies/live.iso")?;
        std::fs::hard_link(
            fx.mount.join("My Movies/live.iso"),
            fx.mount.join("live.iso"),
        )?;
        let outcome = commit(&mut store)?;
        assert!(outcome.aliases_created.is_empty());
        assert_eq!(store.get(id)?.iso_location, "/live.iso");
        Ok(())
    }

    #[test]
    fn test_whitespace_alias_conflict() -> Result<()> {
        let fx = fixture()?;
        let (mut store, _) = store_with_iso(&fx, "/My Movies/live.iso")?;
        std::fs::write(fx.mount.join("live.iso"), b"other")?;
        let err = commit(&mut store).unwrap_err();
        assert!(matches!(err, ConfigError::AliasConflict { .. }), "{err}");
        assert!(!fx.grub.join(CUSTOM_CFG).exists());
        Ok(())
    }

    #[test]
    fn test_whitespace_in_file_name() -> Result<()> {
        let fx = fixture()?;
        let (mut store, _) = store_with_iso(&fx, "/isos/live one.iso")?;
        let err = commit(&mut store).unwrap_err();
        assert!(matches!(err, ConfigError::AliasConflict { .. }), "{err}");
        Ok(())
    }

    #[test]
    fn test_commit_with_absent_mount() -> Result<()> {
        let fx = fixture()?;
        let absent = fx.mount.join("absent-usb");
        let text = format!("\tsubmenu \"Ubuntu\" {{iso_boot \"/isos/ubuntu.iso\"}} #{absent}\n");
        let mut store = EntryStore::load(fx.grub.as_path(), &text)?;
        let outcome = commit(&mut store)?;
        assert_eq!(outcome, CommitOutcome::default());
        let (_, e) = store.entries().next().unwrap();
        assert!(!e.enabled);
        let written = std::fs::read_to_string(fx.grub.join(CUSTOM_CFG))?;
        similar_asserts::assert_eq!(written, format!("{INCIPIT}\n{text}"));
        Ok(())
    }

    #[test]
    fn test_refresh_failure_after_write() -> Result<()> {
        let fx = fixture()?;
        // stat fails with ENAMETOOLONG rather than reporting absence
        let mount = format!("/{}", "x".repeat(300));
        let text = format!("amorce_iso \"/isos/test.iso\" #{mount}\n");
        let mut store = EntryStore::load(fx.grub.as_path(), &text)?;
        assert!(store.refresh_all().is_err());
        let outcome = commit(&mut store)?;
        assert!(outcome.temporary_pending);
        let written = std::fs::read_to_string(fx.grub.join(CUSTOM_CFG))?;
        similar_asserts::assert_eq!(written, format!("{INCIPIT}\n{text}"));
        Ok(())
    }

    #[test]
    fn test_absent_mount_with_loopback() -> Result<()> {
        let fx = fixture()?;
        let absent = fx.mount.join("absent-usb");
        let text = format!("amorce_iso \"/isos/ubuntu.iso\" #{absent}\n");
        let mut store = EntryStore::load(fx.grub.as_path(), &text)?;
        let (id, _) = store.entries().next().unwrap();
        store.set_loopback_content(id, "menuentry x {}\n")?;
        let err = commit(&mut store).unwrap_err();
        assert!(matches!(err, ConfigError::FilesystemIo { .. }), "{err}");
        assert!(!fx.grub.join(CUSTOM_CFG).exists());
        Ok(())
    }

    #[test]
    fn test_missing_config_dir() -> Result<()> {
        let fx = fixture()?;
        let mut store = EntryStore::load(fx.mount.join("nonexistent"), "")?;
        let err = commit(&mut store).unwrap_err();
        assert!(matches!(err, ConfigError::FilesystemIo { .. }));
        Ok(())
    }
}
