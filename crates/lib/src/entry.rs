//! In-memory representation of one ISO boot entry.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::paths;

/// Display name of an entry that has not been configured yet.
pub const PLACEHOLDER_NAME: &str = "<New>";

/// Suffix given to loopback files derived from an ISO location.
const LOOPBACK_SUFFIX: &str = "loopback.cfg";

/// Identifies an entry within an [`crate::store::EntryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(pub(crate) u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A boot entry for an ISO image.
///
/// `iso_location` and `loopback_location` are relative to `mount_point`
/// and always start with `/`; this is how GRUB sees them once it has
/// searched for the device holding the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    /// Menu label. Temporary entries use the ISO file name.
    pub name: String,
    /// Mount-relative ISO path
    pub iso_location: Utf8PathBuf,
    /// Mount-relative path of the loopback file, if any
    pub loopback_location: Option<Utf8PathBuf>,
    /// The loopback body, when loaded or edited
    #[serde(skip)]
    pub loopback_content: Option<String>,
    /// Durable entry (`true`) or one-shot entry (`false`)
    pub permanent: bool,
    /// Absolute root of the device the locations are relative to
    pub mount_point: Utf8PathBuf,
    /// Whether the ISO currently exists; recomputed, never persisted
    pub enabled: bool,
    #[serde(skip)]
    pub(crate) placeholder: bool,
}

/// The display name of a temporary entry: the final component of its ISO path.
pub fn temporary_name(iso_location: &Utf8Path) -> String {
    iso_location
        .file_name()
        .unwrap_or(iso_location.as_str())
        .to_owned()
}

/// Where the loopback body of `iso_location` lives: `foo.iso` becomes
/// `foo.loopback.cfg`.
pub fn loopback_location_for(iso_location: &Utf8Path) -> Utf8PathBuf {
    match iso_location.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("iso") => {
            iso_location.with_extension(LOOPBACK_SUFFIX)
        }
        _ => Utf8PathBuf::from(format!("{iso_location}.{LOOPBACK_SUFFIX}")),
    }
}

impl EntryRecord {
    /// A durable `submenu` entry.
    pub fn permanent(
        name: impl Into<String>,
        iso_location: impl Into<Utf8PathBuf>,
        mount_point: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            iso_location: iso_location.into(),
            loopback_location: None,
            loopback_content: None,
            permanent: true,
            mount_point: mount_point.into(),
            enabled: false,
            placeholder: false,
        }
    }

    /// A one-shot `amorce_iso` entry; its name is derived from the ISO.
    pub fn temporary(
        iso_location: impl Into<Utf8PathBuf>,
        mount_point: impl Into<Utf8PathBuf>,
    ) -> Self {
        let iso_location = iso_location.into();
        let mut r = Self::permanent(temporary_name(&iso_location), iso_location, mount_point);
        r.permanent = false;
        r
    }

    /// An unconfigured entry; never serialized.
    pub fn placeholder(permanent: bool) -> Self {
        let mut r = Self::permanent(PLACEHOLDER_NAME, "", "/");
        r.permanent = permanent;
        r.placeholder = true;
        r
    }

    /// Set the loopback location.
    pub fn with_loopback_location(mut self, location: impl Into<Utf8PathBuf>) -> Self {
        self.loopback_location = Some(location.into());
        self
    }

    /// Returns `true` if this entry has not been configured yet.
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// The absolute path of the ISO on this host.
    pub fn iso_path(&self) -> Utf8PathBuf {
        paths::to_absolute(&self.iso_location, &self.mount_point)
    }

    /// The absolute path of the loopback file on this host.
    pub fn loopback_path(&self) -> Option<Utf8PathBuf> {
        self.loopback_location
            .as_deref()
            .map(|l| paths::to_absolute(l, &self.mount_point))
    }

    /// Point this entry at a new ISO. The entry takes the ISO's file name
    /// and stops being a placeholder.
    ///
    /// A loaded loopback body follows the ISO to its new derived location.
    /// A loopback file whose body was never loaded belongs to the old image
    /// and is dropped from the entry.
    pub(crate) fn set_iso(&mut self, iso_location: Utf8PathBuf, mount_point: Utf8PathBuf) {
        self.name = temporary_name(&iso_location);
        self.loopback_location = self
            .loopback_content
            .as_ref()
            .map(|_| loopback_location_for(&iso_location));
        self.iso_location = iso_location;
        self.mount_point = mount_point;
        self.placeholder = false;
    }

    /// Replace the loopback body. An empty body removes the loopback file
    /// from the entry.
    pub(crate) fn set_loopback_content(&mut self, content: String) {
        if content.is_empty() {
            self.loopback_content = None;
            self.loopback_location = None;
            return;
        }
        if self.loopback_location.is_none() {
            self.loopback_location = Some(loopback_location_for(&self.iso_location));
        }
        self.loopback_content = Some(content);
    }
}
