//! Searching a filesystem tree for GRUB configuration directories.
//!
//! Scanning a whole host can take a long time, so it runs on the blocking
//! thread pool reporting [`ScanEvent`]s and can be cancelled.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Name of the directories we look for.
const GRUB_DIR_NAME: &str = "grub";
/// A GRUB directory must hold this file.
const GRUB_CFG: &str = "grub.cfg";
/// Pseudo filesystems skipped when scanning from `/`.
const SKIP_AT_ROOT: &[&str] = &["proc", "sys", "dev", "run"];

/// Progress of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A GRUB directory was found
    Found(Utf8PathBuf),
    /// `done` of the `total` top-level directories have been searched
    Progress {
        /// Searched so far
        done: u64,
        /// Top-level directories to search
        total: u64,
    },
    /// The scan ended
    Finished {
        /// It was stopped before searching everything
        cancelled: bool,
    },
}

fn is_grub_dir(path: &Utf8Path) -> bool {
    path.file_name() == Some(GRUB_DIR_NAME) && path.join(GRUB_CFG).is_file()
}

fn read_subdirs(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let rd = match dir.read_dir_utf8() {
        Ok(rd) => rd,
        Err(e) => {
            tracing::trace!("Skipping {dir}: {e}");
            return Vec::new();
        }
    };
    let mut r: Vec<_> = rd
        .filter_map(|entry| {
            let entry = entry
                .inspect_err(|e| tracing::trace!("Skipping entry of {dir}: {e}"))
                .ok()?;
            // file_type() does not follow symlinks
            let ft = entry.file_type().ok()?;
            ft.is_dir().then(|| entry.into_path())
        })
        .collect();
    r.sort();
    r
}

fn walk(dir: &Utf8Path, cancel: &CancellationToken, found: &mut dyn FnMut(Utf8PathBuf)) {
    for sub in read_subdirs(dir) {
        if cancel.is_cancelled() {
            return;
        }
        if is_grub_dir(&sub) {
            found(sub.clone());
        }
        walk(&sub, cancel, found);
    }
}

/// Find every directory named `grub` holding a `grub.cfg` below `root`.
///
/// Symbolic links are not followed and unreadable directories are
/// skipped. Cancelling `cancel` stops the scan; what was found so far is
/// still returned.
pub fn scan_for_grub_dirs(
    root: &Utf8Path,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(ScanEvent),
) -> Vec<Utf8PathBuf> {
    let mut results = Vec::new();
    let top: Vec<_> = read_subdirs(root)
        .into_iter()
        .filter(|d| {
            root != "/" || !d.file_name().is_some_and(|n| SKIP_AT_ROOT.contains(&n))
        })
        .collect();
    let total = top.len() as u64;
    for (i, dir) in top.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        walk(dir, cancel, &mut |p| {
            tracing::debug!("Found GRUB directory {p}");
            on_event(ScanEvent::Found(p.clone()));
            results.push(p);
        });
        on_event(ScanEvent::Progress {
            done: i as u64 + 1,
            total,
        });
    }
    let cancelled = cancel.is_cancelled();
    on_event(ScanEvent::Finished { cancelled });
    results
}

/// A scan running on the blocking thread pool.
#[derive(Debug)]
pub struct ScanHandle {
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<ScanEvent>,
    task: tokio::task::JoinHandle<Vec<Utf8PathBuf>>,
}

impl ScanHandle {
    /// Start scanning below `root`. Must be called from within a tokio
    /// runtime.
    pub fn spawn(root: Utf8PathBuf) -> Self {
        let cancel = CancellationToken::new();
        let (tx, events) = mpsc::unbounded_channel();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            // The receiver going away only means nobody is listening.
            scan_for_grub_dirs(&root, &token, |ev| {
                let _ = tx.send(ev);
            })
        });
        Self {
            cancel,
            events,
            task,
        }
    }

    /// Ask the scan to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The next event from the scan; `None` once it has ended.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Wait for the scan to end and return the directories found.
    pub async fn join(self) -> Result<Vec<Utf8PathBuf>> {
        Ok(self.task.await?)
    }
}
