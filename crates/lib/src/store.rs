//! The entries of one GRUB configuration directory.
//!
//! An [`EntryStore`] holds the parsed `custom.cfg` of a directory in file
//! order, including lines we do not manage, and mediates every edit so
//! that the record invariants hold and observers are told about changes.

use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::entry::{EntryId, EntryRecord};
use crate::error::{ConfigError, IoResultExt};
use crate::parsers::custom_cfg::{self, ConfigItem, Line};
use crate::paths;

/// The file holding our entries, relative to the GRUB directory.
pub const CUSTOM_CFG: &str = "custom.cfg";

// Shared across stores so an id from one store is never valid in another.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> EntryId {
    EntryId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A change made to an [`EntryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// An entry was appended
    Added(EntryId),
    /// An entry was removed
    Removed(EntryId),
    /// A field of an entry changed
    Changed(EntryId),
}

type Observer = Box<dyn FnMut(&StoreEvent)>;

#[derive(Debug)]
enum Slot {
    Entry(EntryId, EntryRecord),
    Passthrough(String),
}

/// The ordered boot entries of one configuration directory.
pub struct EntryStore {
    dir: Utf8PathBuf,
    slots: Vec<Slot>,
    permanence_allowed: bool,
    observers: Vec<Observer>,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("dir", &self.dir)
            .field("slots", &self.slots)
            .field("permanence_allowed", &self.permanence_allowed)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EntryStore {
    /// Build a store for `dir` from the text of its `custom.cfg`.
    ///
    /// If the text holds no entry, a placeholder is added so that there is
    /// always something to edit.
    pub fn load(dir: impl Into<Utf8PathBuf>, text: &str) -> Result<Self, ConfigError> {
        let config = custom_cfg::parse(text)?;
        let slots = config
            .items
            .into_iter()
            .map(|item| match item {
                ConfigItem::Entry(e) => Slot::Entry(next_id(), e),
                ConfigItem::Passthrough(l) => Slot::Passthrough(l),
            })
            .collect();
        let mut store = Self {
            dir: dir.into(),
            slots,
            permanence_allowed: true,
            observers: Vec::new(),
        };
        if store.is_empty() {
            store.add();
        }
        Ok(store)
    }

    /// Load the `custom.cfg` of `dir` from disk, if there is one.
    ///
    /// Loopback bodies are read from their files; an unreadable loopback
    /// file is logged and left unloaded.
    pub fn open(dir: &Utf8Path) -> Result<Self, ConfigError> {
        let d = Dir::open_ambient_dir(dir, ambient_authority())
            .io_context(|| format!("Opening {dir}"))?;
        let text = match d
            .open_optional(CUSTOM_CFG)
            .io_context(|| format!("Opening {dir}/{CUSTOM_CFG}"))?
        {
            Some(f) => std::io::read_to_string(f)
                .io_context(|| format!("Reading {dir}/{CUSTOM_CFG}"))?,
            None => {
                tracing::debug!("No {CUSTOM_CFG} in {dir}");
                String::new()
            }
        };
        let mut store = Self::load(dir, &text)?;
        for entry in store.entries_mut() {
            let Some(path) = entry.loopback_path() else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) if !content.is_empty() => entry.loopback_content = Some(content),
                Ok(_) => tracing::debug!("Empty loopback file {path}"),
                Err(e) => tracing::warn!("Failed to read loopback file {path}: {e}"),
            }
        }
        store.refresh_all()?;
        Ok(store)
    }

    fn notify(&mut self, event: StoreEvent) {
        tracing::trace!("{}: {event:?}", self.dir);
        for observer in self.observers.iter_mut() {
            observer(&event);
        }
    }

    /// Register a callback invoked after every change.
    pub fn subscribe(&mut self, observer: impl FnMut(&StoreEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// The configuration directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// The path of the `custom.cfg` this store is written to.
    pub fn config_path(&self) -> Utf8PathBuf {
        self.dir.join(CUSTOM_CFG)
    }

    /// Iterate over the entries in order.
    pub fn entries(&self) -> impl Iterator<Item = (EntryId, &EntryRecord)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Entry(id, e) => Some((*id, e)),
            Slot::Passthrough(_) => None,
        })
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut EntryRecord> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Entry(_, e) => Some(e),
            Slot::Passthrough(_) => None,
        })
    }

    /// The number of entries, placeholders included.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Returns `true` if there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Look up an entry.
    pub fn get(&self, id: EntryId) -> Result<&EntryRecord, ConfigError> {
        self.entries()
            .find_map(|(i, e)| (i == id).then_some(e))
            .ok_or(ConfigError::NotFound(id))
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut EntryRecord, ConfigError> {
        self.slots
            .iter_mut()
            .find_map(|slot| match slot {
                Slot::Entry(i, e) if *i == id => Some(e),
                _ => None,
            })
            .ok_or(ConfigError::NotFound(id))
    }

    /// Find the first entry with the given display name.
    pub fn find_by_name(&self, name: &str) -> Option<EntryId> {
        self.entries()
            .find_map(|(id, e)| (e.name == name).then_some(id))
    }

    /// Returns `true` if an unconfigured entry is present.
    pub fn has_placeholder(&self) -> bool {
        self.entries().any(|(_, e)| e.is_placeholder())
    }

    /// Returns `true` if any configured entry is one-shot.
    pub fn has_temporary(&self) -> bool {
        self.entries()
            .any(|(_, e)| !e.is_placeholder() && !e.permanent)
    }

    /// Whether this directory can host permanent entries.
    pub fn permanence_allowed(&self) -> bool {
        self.permanence_allowed
    }

    /// Set whether this directory can host permanent entries; decided by
    /// the caller from the filesystem and device holding the directory.
    pub fn set_permanence_allowed(&mut self, allowed: bool) {
        self.permanence_allowed = allowed;
    }

    /// Remove unconfigured entries, returning how many were dropped.
    pub(crate) fn drop_placeholders(&mut self) -> usize {
        let ids: Vec<_> = self
            .entries()
            .filter(|(_, e)| e.is_placeholder())
            .map(|(id, _)| id)
            .collect();
        for &id in &ids {
            self.slots
                .retain(|slot| !matches!(slot, Slot::Entry(i, _) if *i == id));
            self.notify(StoreEvent::Removed(id));
        }
        ids.len()
    }

    /// Append a new unconfigured entry, replacing any previous one.
    pub fn add(&mut self) -> EntryId {
        self.drop_placeholders();
        let id = next_id();
        let entry = EntryRecord::placeholder(self.permanence_allowed);
        self.slots.push(Slot::Entry(id, entry));
        self.notify(StoreEvent::Added(id));
        id
    }

    /// Remove an entry.
    pub fn remove(&mut self, id: EntryId) -> Result<EntryRecord, ConfigError> {
        let pos = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Entry(i, _) if *i == id))
            .ok_or(ConfigError::NotFound(id))?;
        let Slot::Entry(_, entry) = self.slots.remove(pos) else {
            unreachable!("position() matched an entry slot");
        };
        self.notify(StoreEvent::Removed(id));
        Ok(entry)
    }

    /// Mark an entry as permanent or temporary. Other entries are not touched.
    pub fn set_permanent(&mut self, id: EntryId, permanent: bool) -> Result<(), ConfigError> {
        if permanent && !self.permanence_allowed {
            return Err(ConfigError::PermanenceUnsupported(self.dir.clone()));
        }
        self.get_mut(id)?.permanent = permanent;
        self.notify(StoreEvent::Changed(id));
        Ok(())
    }

    /// Rename an entry. Only permanent entries keep their name on disk.
    pub fn set_name(&mut self, id: EntryId, name: &str) -> Result<(), ConfigError> {
        self.get_mut(id)?.name = name.to_owned();
        self.notify(StoreEvent::Changed(id));
        Ok(())
    }

    /// Point an entry at the ISO at absolute path `iso`, resolving the
    /// mount point of the filesystem holding it.
    pub fn set_iso_location(&mut self, id: EntryId, iso: &Utf8Path) -> Result<(), ConfigError> {
        let mount_point = paths::find_mount(iso)?;
        self.set_iso_location_under(id, iso, &mount_point)
    }

    /// Like [`Self::set_iso_location`], with a known mount point.
    pub fn set_iso_location_under(
        &mut self,
        id: EntryId,
        iso: &Utf8Path,
        mount_point: &Utf8Path,
    ) -> Result<(), ConfigError> {
        let relative = paths::to_relative(iso, mount_point)?;
        let entry = self.get_mut(id)?;
        entry.set_iso(relative, mount_point.to_owned());
        tracing::debug!("{id}: ISO {} on {}", entry.iso_location, entry.mount_point);
        self.refresh_enabled(id)?;
        self.notify(StoreEvent::Changed(id));
        Ok(())
    }

    /// Replace the loopback body of an entry; empty text drops it.
    pub fn set_loopback_content(&mut self, id: EntryId, content: &str) -> Result<(), ConfigError> {
        self.get_mut(id)?.set_loopback_content(content.to_owned());
        self.notify(StoreEvent::Changed(id));
        Ok(())
    }

    /// Recompute whether the ISO of an entry exists.
    pub fn refresh_enabled(&mut self, id: EntryId) -> Result<bool, ConfigError> {
        let entry = self.get_mut(id)?;
        entry.enabled = iso_exists(entry)?;
        Ok(entry.enabled)
    }

    /// Recompute [`EntryRecord::enabled`] for every entry.
    pub fn refresh_all(&mut self) -> Result<(), ConfigError> {
        for entry in self.entries_mut() {
            entry.enabled = iso_exists(entry)?;
        }
        Ok(())
    }

    /// Render the store to `custom.cfg` text.
    pub fn serialize(&self) -> Result<String, ConfigError> {
        custom_cfg::serialize_lines(self.slots.iter().map(|slot| match slot {
            Slot::Entry(_, e) => Line::Entry(e),
            Slot::Passthrough(l) => Line::Passthrough(l),
        }))
    }
}

fn iso_exists(entry: &EntryRecord) -> Result<bool, ConfigError> {
    if entry.is_placeholder() {
        return Ok(false);
    }
    let path = entry.iso_path();
    path.try_exists()
        .io_context(|| format!("Checking for {path}"))
}
