//! # ISO boot entries for GRUB
//!
//! This crate manages the `custom.cfg` of a GRUB configuration directory
//! so that GRUB can boot ISO images stored on the host's filesystems,
//! either from a permanent menu entry or once on the next boot.
//!
//! The pieces, from the bottom up:
//!
//! - [`paths`] converts between host paths and the mount-relative paths
//!   GRUB uses.
//! - [`entry::EntryRecord`] is one boot entry.
//! - [`parsers::custom_cfg`] reads and writes the line grammar of
//!   `custom.cfg`.
//! - [`store::EntryStore`] holds the entries of one directory and
//!   [`session::Session`] those of several.
//! - [`reconcile`] writes a store back to disk.

pub mod cli;
pub mod config;
pub mod entry;
pub mod error;
pub mod grub;
pub mod loopback;
pub mod parsers;
pub mod paths;
pub mod reconcile;
pub mod scan;
pub mod session;
pub mod store;

pub use entry::{EntryId, EntryRecord};
pub use error::ConfigError;
pub use reconcile::{CommitOutcome, commit};
pub use session::Session;
pub use store::{EntryStore, StoreEvent};
