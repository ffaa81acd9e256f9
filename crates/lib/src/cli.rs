//! # Command line interface
//!
//! Every subcommand editing entries writes the result back immediately:
//! `custom.cfg`, loopback files and aliases, the GRUB hook, and optionally
//! the GRUB environment flag arming temporary entries.

use std::ffi::OsString;
use std::io::{Read as _, Write as _};

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use rustix::process::getuid;
use serde::Serialize;

use crate::config::Config;
use crate::entry::{EntryId, EntryRecord};
use crate::grub::{self, BootloaderTools, GrubCommands, PostCommit};
use crate::loopback;
use crate::scan::{ScanEvent, ScanHandle};
use crate::session::Session;
use crate::store::EntryStore;

/// Options controlling what happens to GRUB after writing entries.
#[derive(Debug, Default, Parser, PartialEq, Eq)]
pub(crate) struct CommitOpts {
    /// Arm temporary entries so the next boot starts the ISO
    #[clap(long)]
    pub(crate) activate_temporary: bool,

    /// Regenerate grub.cfg with grub-mkconfig before installing the hook
    #[clap(long)]
    pub(crate) regenerate: bool,
}

impl From<&CommitOpts> for PostCommit {
    fn from(o: &CommitOpts) -> Self {
        Self {
            activate_temporary: o.activate_temporary,
            regenerate: o.regenerate,
        }
    }
}

/// Options for adding an entry
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct AddOpts {
    /// Path to the ISO image
    pub(crate) iso: Utf8PathBuf,

    /// Menu label; defaults to the file name of the image
    #[clap(long)]
    pub(crate) name: Option<String>,

    /// Boot the image once instead of adding a permanent menu entry
    #[clap(long)]
    pub(crate) temporary: bool,

    /// Use this loopback config (`-` for standard input)
    #[clap(long, conflicts_with = "generate_loopback")]
    pub(crate) loopback_file: Option<Utf8PathBuf>,

    /// Use the loopback config shipped in the image
    #[clap(long)]
    pub(crate) generate_loopback: bool,

    /// Add French locale and keyboard arguments to the kernel command lines
    #[clap(long)]
    pub(crate) french: bool,

    #[clap(flatten)]
    pub(crate) commit: CommitOpts,
}

/// Edit ISO boot entries of a GRUB installation.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "grubenhancer", version)]
pub(crate) struct Cli {
    /// The GRUB directory to use
    #[clap(short = 'd', long, global = true)]
    pub(crate) directory: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) cmd: Opt,
}

/// Subcommands. Entries are named by their 1-based position in `list`, or
/// by their name.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Show the entries of the GRUB directory
    List {
        /// Output JSON
        #[clap(long)]
        json: bool,
    },
    /// Add an entry booting an ISO image
    Add(AddOpts),
    /// Remove an entry
    Remove {
        /// The entry
        entry: String,
        #[clap(flatten)]
        commit: CommitOpts,
    },
    /// Make an entry permanent (`true`) or temporary (`false`)
    SetPermanent {
        /// The entry
        entry: String,
        /// Whether the entry is permanent
        #[clap(action = clap::ArgAction::Set)]
        permanent: bool,
        #[clap(flatten)]
        commit: CommitOpts,
    },
    /// Point an entry at another ISO image
    SetIso {
        /// The entry
        entry: String,
        /// Path to the ISO image
        iso: Utf8PathBuf,
        #[clap(flatten)]
        commit: CommitOpts,
    },
    /// Replace the loopback config of an entry; an empty file removes it
    SetLoopback {
        /// The entry
        entry: String,
        /// The loopback config (`-` for standard input)
        file: Utf8PathBuf,
        #[clap(flatten)]
        commit: CommitOpts,
    },
    /// Write the current entries back and install the GRUB hook
    Commit(CommitOpts),
    /// Print the loopback config shipped in an ISO image
    Loopback {
        /// Path to the ISO image
        iso: Utf8PathBuf,
        /// Add French locale and keyboard arguments
        #[clap(long)]
        french: bool,
    },
    /// Search for GRUB directories
    Scan {
        /// Where to start
        #[clap(default_value = "/")]
        root: Utf8PathBuf,
    },
    /// Print the custom.cfg that would be written
    Render,
}

fn read_input(path: &Utf8Path) -> Result<String> {
    if path == "-" {
        let mut s = String::new();
        std::io::stdin()
            .read_to_string(&mut s)
            .context("Reading standard input")?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))
}

fn absolute_iso(iso: &Utf8Path) -> Result<Utf8PathBuf> {
    let p = std::fs::canonicalize(iso).with_context(|| format!("Resolving {iso}"))?;
    Utf8PathBuf::try_from(p).context("Non UTF-8 ISO path")
}

/// Look up an entry by 1-based position or by name.
pub(crate) fn resolve_entry(store: &EntryStore, selector: &str) -> Result<EntryId> {
    if let Ok(n) = selector.parse::<usize>() {
        return store
            .entries()
            .nth(n.wrapping_sub(1))
            .map(|(id, _)| id)
            .with_context(|| format!("No entry at position {n}"));
    }
    store
        .find_by_name(selector)
        .with_context(|| format!("No entry named {selector:?}"))
}

#[derive(Debug, Serialize)]
struct ListedEntry<'a> {
    index: usize,
    #[serde(flatten)]
    entry: &'a EntryRecord,
}

fn kind(e: &EntryRecord) -> &'static str {
    match (e.is_placeholder(), e.permanent) {
        (true, _) => "new",
        (false, true) => "permanent",
        (false, false) => "temporary",
    }
}

fn format_table(store: &EntryStore) -> String {
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(["#", "NAME", "KIND", "ISO", "LOOPBACK", "MOUNT", "PRESENT"]);
    for (i, (_, e)) in store.entries().enumerate() {
        let loopback = e.loopback_path().map(|p| p.to_string()).unwrap_or_default();
        let iso = if e.is_placeholder() {
            String::new()
        } else {
            e.iso_path().to_string()
        };
        table.add_row([
            (i + 1).to_string(),
            e.name.clone(),
            kind(e).to_owned(),
            iso,
            loopback,
            e.mount_point.to_string(),
            if e.enabled { "yes" } else { "no" }.to_owned(),
        ]);
    }
    table.to_string()
}

/// State shared by the subcommands.
struct CliContext {
    config: Config,
    dir: Utf8PathBuf,
    tools: GrubCommands,
}

impl CliContext {
    /// Load the store of the GRUB directory, read-only.
    fn load(&self) -> Result<EntryStore> {
        Ok(EntryStore::open(&self.dir)?)
    }

    /// Open the GRUB directory for editing.
    #[context("Opening GRUB directory for editing")]
    fn edit(&self) -> Result<Session> {
        ensure!(getuid().is_root(), "Editing GRUB entries requires root");
        let d = Dir::open_ambient_dir(&self.dir, ambient_authority())?;
        ensure!(
            grub::is_grub_dir(&d)?,
            "{} has no grub.cfg; use `scan` to find GRUB directories",
            self.dir
        );
        let allowed = match grub::permanence_supported(&self.dir, &self.tools, &self.config) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("{e:#}; assuming permanent entries are supported");
                true
            }
        };
        let mut session = Session::new();
        session.open(&self.dir)?.set_permanence_allowed(allowed);
        Ok(session)
    }

    fn store<'s>(&self, session: &'s mut Session) -> Result<&'s mut EntryStore> {
        Ok(session.open(&self.dir)?)
    }

    /// Write every store of the session and update GRUB.
    fn commit(&self, session: &mut Session, opts: &CommitOpts) -> Result<()> {
        let mut first_err = None;
        for (dir, r) in session.commit_all() {
            match r {
                Ok(outcome) => {
                    for alias in &outcome.aliases_created {
                        println!("Created {alias}");
                    }
                    grub::post_commit(
                        &dir,
                        &self.tools as &dyn BootloaderTools,
                        &self.config.env_flag,
                        opts.into(),
                        outcome.temporary_pending,
                    )?;
                    println!("Updated {dir}");
                }
                Err(e) if first_err.is_none() => {
                    first_err = Some(anyhow::Error::new(e).context(format!("Committing {dir}")));
                }
                // Already logged by the session
                Err(_) => {}
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn add(&self, opts: &AddOpts) -> Result<()> {
        let iso = absolute_iso(&opts.iso)?;
        let loopback = match (&opts.loopback_file, opts.generate_loopback) {
            (Some(f), _) => Some(read_input(f)?),
            (None, true) => Some(loopback::generate_from_iso(&iso)?),
            (None, false) => None,
        };
        let loopback = match loopback {
            Some(l) if opts.french => Some(loopback::add_french_translations(&l)),
            l => l,
        };

        let mut session = self.edit()?;
        let id = session.add_entry(&self.dir)?;
        let store = self.store(&mut session)?;
        store.set_iso_location(id, &iso)?;
        if opts.temporary {
            store.set_permanent(id, false)?;
        } else {
            ensure!(
                store.permanence_allowed(),
                "{} cannot hold permanent entries; use --temporary",
                self.dir
            );
            store.set_permanent(id, true)?;
        }
        if let Some(name) = opts.name.as_deref() {
            if opts.temporary {
                tracing::warn!("Temporary entries are named after their image; ignoring --name");
            } else {
                store.set_name(id, name)?;
            }
        }
        if let Some(l) = loopback.as_deref() {
            store.set_loopback_content(id, l)?;
        }
        // The placeholder was consumed
        self.commit(&mut session, &opts.commit)
    }

    /// Apply `f` to the entry named by `entry`, then commit.
    fn edit_entry<F>(&self, entry: &str, opts: &CommitOpts, f: F) -> Result<()>
    where
        F: FnOnce(&mut EntryStore, EntryId) -> Result<()>,
    {
        let mut session = self.edit()?;
        let store = self.store(&mut session)?;
        let id = resolve_entry(store, entry)?;
        f(store, id)?;
        self.commit(&mut session, opts)
    }

    fn list(&self, json: bool) -> Result<()> {
        let store = self.load()?;
        if json {
            let entries: Vec<_> = store
                .entries()
                .enumerate()
                .filter(|(_, (_, e))| !e.is_placeholder())
                .map(|(i, (_, entry))| ListedEntry {
                    index: i + 1,
                    entry,
                })
                .collect();
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &entries)?;
            writeln!(stdout)?;
        } else {
            println!("{}", format_table(&store));
        }
        Ok(())
    }

    async fn scan(&self, root: &Utf8Path) -> Result<()> {
        let mut handle = ScanHandle::spawn(root.to_owned());
        let bar = indicatif::ProgressBar::new(0);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{prefix} {bar} {pos}/{len} {wide_msg}")?,
        );
        bar.set_prefix("Scanning");
        let mut cancelled = false;
        loop {
            tokio::select! {
                ev = handle.next_event() => match ev {
                    Some(ScanEvent::Found(p)) => bar.println(p.as_str()),
                    Some(ScanEvent::Progress { done, total }) => {
                        bar.set_length(total);
                        bar.set_position(done);
                    }
                    Some(ScanEvent::Finished { cancelled: c }) => {
                        cancelled = c;
                        break;
                    }
                    None => break,
                },
                r = tokio::signal::ctrl_c() => {
                    r.context("Waiting for interrupt")?;
                    bar.set_message("cancelling");
                    handle.cancel();
                }
            }
        }
        bar.finish_and_clear();
        let found = handle.join().await?;
        if cancelled {
            eprintln!("Scan interrupted; results are incomplete");
        } else if found.is_empty() {
            println!("No GRUB directory found below {root}");
        }
        for p in found {
            println!("{p}");
        }
        Ok(())
    }

    async fn run(&self, cmd: Opt) -> Result<()> {
        match cmd {
            Opt::List { json } => self.list(json),
            Opt::Add(opts) => self.add(&opts),
            Opt::Remove { entry, commit } => self.edit_entry(&entry, &commit, |store, id| {
                let e = store.remove(id)?;
                println!("Removed {}", e.name);
                Ok(())
            }),
            Opt::SetPermanent {
                entry,
                permanent,
                commit,
            } => self.edit_entry(&entry, &commit, |store, id| {
                Ok(store.set_permanent(id, permanent)?)
            }),
            Opt::SetIso { entry, iso, commit } => {
                let iso = absolute_iso(&iso)?;
                self.edit_entry(&entry, &commit, |store, id| {
                    Ok(store.set_iso_location(id, &iso)?)
                })
            }
            Opt::SetLoopback {
                entry,
                file,
                commit,
            } => {
                let content = read_input(&file)?;
                self.edit_entry(&entry, &commit, |store, id| {
                    Ok(store.set_loopback_content(id, &content)?)
                })
            }
            Opt::Commit(opts) => {
                let mut session = self.edit()?;
                self.commit(&mut session, &opts)
            }
            Opt::Loopback { iso, french } => {
                ensure!(getuid().is_root(), "Mounting an image requires root");
                let content = loopback::generate_from_iso(&iso)?;
                let content = if french {
                    loopback::add_french_translations(&content)
                } else {
                    content
                };
                print!("{content}");
                Ok(())
            }
            Opt::Scan { root } => self.scan(&root).await,
            Opt::Render => {
                print!("{}", self.load()?.serialize()?);
                Ok(())
            }
        }
    }
}

/// Parse the provided arguments and execute.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let config = Config::load()?;
    let dir = cli.directory.unwrap_or_else(|| config.grub_dir.clone());
    tracing::debug!("Using GRUB directory {dir}");
    let cx = CliContext {
        config,
        dir,
        tools: GrubCommands,
    };
    cx.run(cli.cmd).await
}
