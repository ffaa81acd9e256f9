//! Editing entries across several GRUB configuration directories.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use camino::{Utf8Path, Utf8PathBuf};

use crate::entry::EntryId;
use crate::error::ConfigError;
use crate::reconcile::{self, CommitOutcome};
use crate::store::EntryStore;

/// The stores open for editing, keyed by configuration directory.
///
/// At most one unconfigured entry exists across all of them.
#[derive(Debug, Default)]
pub struct Session {
    stores: BTreeMap<Utf8PathBuf, EntryStore>,
}

impl Session {
    /// An empty session.
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_placeholders_except(&mut self, dir: &Utf8Path) {
        for (d, store) in self.stores.iter_mut() {
            if d != dir && store.drop_placeholders() > 0 {
                tracing::debug!("Dropped unconfigured entry of {d}");
            }
        }
    }

    /// Add an already loaded store, replacing any store for the same
    /// directory.
    pub fn insert(&mut self, store: EntryStore) -> &mut EntryStore {
        let dir = store.dir().to_owned();
        if store.has_placeholder() {
            self.drop_placeholders_except(&dir);
        }
        match self.stores.entry(dir) {
            Entry::Occupied(mut o) => {
                o.insert(store);
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert(store),
        }
    }

    /// The store for `dir`, loading it from disk on first use.
    pub fn open(&mut self, dir: &Utf8Path) -> Result<&mut EntryStore, ConfigError> {
        let store = match self.stores.remove(dir) {
            Some(store) => store,
            None => EntryStore::open(dir)?,
        };
        Ok(self.insert(store))
    }

    /// The store for `dir`, if it is open.
    pub fn store(&self, dir: &Utf8Path) -> Option<&EntryStore> {
        self.stores.get(dir)
    }

    /// Iterate over the open stores.
    pub fn stores(&self) -> impl Iterator<Item = &EntryStore> {
        self.stores.values()
    }

    /// Append a new unconfigured entry to the store for `dir`. Any other
    /// unconfigured entry in the session is dropped.
    pub fn add_entry(&mut self, dir: &Utf8Path) -> Result<EntryId, ConfigError> {
        self.open(dir)?;
        self.drop_placeholders_except(dir);
        let store = self.open(dir)?;
        Ok(store.add())
    }

    /// Commit every open store. A failure in one directory does not stop
    /// the others from being written.
    pub fn commit_all(&mut self) -> Vec<(Utf8PathBuf, Result<CommitOutcome, ConfigError>)> {
        self.stores
            .iter_mut()
            .map(|(dir, store)| {
                let r = reconcile::commit(store);
                if let Err(e) = &r {
                    tracing::error!("Failed to commit {dir}: {e}");
                }
                (dir.clone(), r)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn placeholders(session: &Session) -> usize {
        session
            .stores()
            .map(|s| s.entries().filter(|(_, e)| e.is_placeholder()).count())
            .sum()
    }

    #[test]
    fn test_single_placeholder() -> Result<()> {
        let mut session = Session::new();
        session.insert(EntryStore::load("/a", "")?);
        assert_eq!(placeholders(&session), 1);
        session.insert(EntryStore::load("/b", "")?);
        assert_eq!(placeholders(&session), 1);
        assert!(session.store(Utf8Path::new("/b")).unwrap().has_placeholder());

        let id = session.add_entry(Utf8Path::new("/a"))?;
        assert_eq!(placeholders(&session), 1);
        let a = session.store(Utf8Path::new("/a")).unwrap();
        assert!(a.get(id)?.is_placeholder());
        assert!(!session.store(Utf8Path::new("/b")).unwrap().has_placeholder());
        Ok(())
    }

    #[test]
    fn test_open_reuses_store() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let mut session = Session::new();
        let id = session.open(dir)?.add();
        let store = session.open(dir)?;
        assert!(store.get(id)?.is_placeholder());
        assert_eq!(store.len(), 1);
        assert_eq!(session.stores().count(), 1);
        Ok(())
    }

    #[test]
    fn test_commit_all_continues_after_failure() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let good = root.join("good");
        std::fs::create_dir(&good)?;

        let mut session = Session::new();
        session.insert(EntryStore::load(root.join("bad"), "")?);
        session.open(&good)?;
        let results = session.commit_all();
        assert_eq!(results.len(), 2);
        let (bad_dir, bad) = &results[0];
        assert_eq!(*bad_dir, root.join("bad"));
        assert!(matches!(bad, Err(ConfigError::FilesystemIo { .. })));
        let (_, ok) = &results[1];
        assert!(ok.is_ok());
        assert!(good.join("custom.cfg").exists());
        Ok(())
    }
}
